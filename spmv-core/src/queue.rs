use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::buffer::DeviceBuffer;
use crate::context::{ComputeContext, ContextBackend, DeviceClass};
use crate::error::CoreError;
use crate::event::{Completion, TransferHandle};

/// Handle to one device's command queues.
///
/// Every queue owns its context (kernel cache, counters, lanes); two queues
/// compare equal only if they share the same context. Kernel launches and
/// writes on the primary lane execute in enqueue order; the transfer lane is
/// independent and synchronizes through [`Completion`] handles.
#[derive(Clone)]
pub struct DeviceQueue {
    ctx: Arc<ComputeContext>,
}

impl DeviceQueue {
    /// Creates a general-purpose queue backed by host worker threads.
    pub fn host() -> Result<DeviceQueue, CoreError> {
        Ok(DeviceQueue {
            ctx: ComputeContext::new_host()?,
        })
    }

    /// Creates a wide-SIMD queue on the preferred wgpu adapter.
    pub async fn gpu() -> Result<DeviceQueue, CoreError> {
        Ok(DeviceQueue {
            ctx: ComputeContext::new_gpu().await?,
        })
    }

    pub fn context(&self) -> &Arc<ComputeContext> {
        &self.ctx
    }

    pub fn class(&self) -> DeviceClass {
        self.ctx.class()
    }

    pub fn same_context(&self, other: &DeviceQueue) -> bool {
        self.ctx.id() == other.ctx.id()
    }

    /// Creates a device buffer initialized from `data`.
    pub fn upload<T: Pod + Send + Sync>(
        &self,
        label: &str,
        data: &[T],
    ) -> Result<DeviceBuffer<T>, CoreError> {
        let bytes = std::mem::size_of_val(data) as u64;
        let buffer = match &self.ctx.backend {
            ContextBackend::Host(_) => DeviceBuffer::host(data.to_vec()),
            ContextBackend::Gpu(gpu) => {
                let raw = if data.is_empty() {
                    gpu.create_storage_buffer(label, 0)
                } else {
                    gpu.create_buffer_with_data(
                        label,
                        bytemuck::cast_slice(data),
                        wgpu::BufferUsages::STORAGE
                            | wgpu::BufferUsages::COPY_DST
                            | wgpu::BufferUsages::COPY_SRC,
                    )
                };
                DeviceBuffer::gpu(raw, data.len())
            }
        };
        self.ctx.note_upload(bytes);
        Ok(buffer)
    }

    /// Creates a zero-initialized device buffer of `len` elements.
    pub fn alloc<T: Pod + Send + Sync>(
        &self,
        label: &str,
        len: usize,
    ) -> Result<DeviceBuffer<T>, CoreError> {
        match &self.ctx.backend {
            ContextBackend::Host(_) => Ok(DeviceBuffer::host(vec![T::zeroed(); len])),
            ContextBackend::Gpu(gpu) => {
                let size_bytes = (len * std::mem::size_of::<T>()) as u64;
                Ok(DeviceBuffer::gpu(
                    gpu.create_storage_buffer(label, size_bytes),
                    len,
                ))
            }
        }
    }

    /// Overwrites `buffer` with `data`, ordered before every later command
    /// on the primary lane.
    pub fn write_buffer<T: Pod + Send + Sync>(
        &self,
        buffer: &DeviceBuffer<T>,
        data: &[T],
    ) -> Result<(), CoreError> {
        if data.len() != buffer.len() {
            return Err(CoreError::Transfer(format!(
                "write of {} elements into a buffer of {}",
                data.len(),
                buffer.len()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        match &self.ctx.backend {
            ContextBackend::Host(host) => {
                let store = buffer.host_store()?.clone();
                let owned = data.to_vec();
                host.primary.enqueue(Box::new(move || {
                    let mut guard = store.write().unwrap_or_else(|e| e.into_inner());
                    guard.copy_from_slice(&owned);
                }))?;
            }
            ContextBackend::Gpu(gpu) => {
                gpu.queue
                    .write_buffer(buffer.gpu_buffer()?, 0, bytemuck::cast_slice(data));
            }
        }
        self.ctx.note_upload(std::mem::size_of_val(data) as u64);
        Ok(())
    }

    /// Reads `buffer` back to host memory, ordered after every command
    /// already enqueued on the primary lane.
    pub fn read_buffer<T: Pod + Send + Sync>(
        &self,
        buffer: &DeviceBuffer<T>,
    ) -> Result<TransferHandle<T>, CoreError> {
        if buffer.is_empty() {
            return Ok(TransferHandle::ready(Vec::new()));
        }
        self.ctx.note_readback(buffer.size_bytes());
        match &self.ctx.backend {
            ContextBackend::Host(host) => {
                let store = buffer.host_store()?.clone();
                let (tx, handle) = TransferHandle::pending(self.ctx.clone());
                host.primary.enqueue(Box::new(move || {
                    let guard = store.read().unwrap_or_else(|e| e.into_inner());
                    tx.finish(Ok(guard.clone()));
                }))?;
                Ok(handle)
            }
            ContextBackend::Gpu(gpu) => {
                let rx = gpu.begin_readback(buffer.gpu_buffer()?, buffer.len());
                Ok(TransferHandle::from_receiver(rx, self.ctx.clone()))
            }
        }
    }

    /// Device-side copy of `src` into `dst` (equal lengths), ordered on the
    /// primary lane.
    pub fn copy_buffer<T: Pod + Send + Sync>(
        &self,
        src: &DeviceBuffer<T>,
        dst: &DeviceBuffer<T>,
    ) -> Result<(), CoreError> {
        if src.len() != dst.len() {
            return Err(CoreError::Transfer(format!(
                "copy of {} elements into a buffer of {}",
                src.len(),
                dst.len()
            )));
        }
        if src.is_empty() {
            return Ok(());
        }
        match &self.ctx.backend {
            ContextBackend::Host(host) => {
                let from = src.host_store()?.clone();
                let to = dst.host_store()?.clone();
                if Arc::ptr_eq(&from, &to) {
                    return Ok(());
                }
                host.primary.enqueue(Box::new(move || {
                    let data = {
                        let guard = from.read().unwrap_or_else(|e| e.into_inner());
                        guard.clone()
                    };
                    let mut guard = to.write().unwrap_or_else(|e| e.into_inner());
                    guard.copy_from_slice(&data);
                }))?;
            }
            ContextBackend::Gpu(gpu) => {
                let mut encoder =
                    gpu.device
                        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some("buffer copy"),
                        });
                encoder.copy_buffer_to_buffer(
                    src.gpu_buffer()?,
                    0,
                    dst.gpu_buffer()?,
                    0,
                    src.size_bytes(),
                );
                gpu.queue.submit(std::iter::once(encoder.finish()));
            }
        }
        Ok(())
    }

    /// Uploads `data` into `buffer` on the transfer lane; the returned
    /// handle completes when the write has landed. Meant for ghost-value
    /// staging, so it never blocks the primary lane.
    pub fn stage_upload<T: Pod + Send + Sync>(
        &self,
        buffer: &DeviceBuffer<T>,
        data: Vec<T>,
    ) -> Result<Completion, CoreError> {
        if data.len() != buffer.len() {
            return Err(CoreError::Transfer(format!(
                "staged write of {} elements into a buffer of {}",
                data.len(),
                buffer.len()
            )));
        }
        if data.is_empty() {
            return Ok(Completion::ready());
        }
        self.ctx
            .note_upload(std::mem::size_of_val(data.as_slice()) as u64);
        match &self.ctx.backend {
            ContextBackend::Host(host) => {
                let store = buffer.host_store()?.clone();
                let (tx, completion) = Completion::pending();
                host.transfer.enqueue(Box::new(move || {
                    let mut guard = store.write().unwrap_or_else(|e| e.into_inner());
                    guard.copy_from_slice(&data);
                    tx.finish(Ok(()));
                }))?;
                Ok(completion)
            }
            ContextBackend::Gpu(gpu) => {
                // A queue write is ordered before later submissions on the
                // same wgpu queue, so the handle can complete immediately.
                gpu.queue
                    .write_buffer(buffer.gpu_buffer()?, 0, bytemuck::cast_slice(&data));
                Ok(Completion::ready())
            }
        }
    }

    /// Reads `buffer` on the transfer lane once `after` has completed.
    /// Pairs with a gather launched on the primary lane.
    pub fn read_after<T: Pod + Send + Sync>(
        &self,
        buffer: &DeviceBuffer<T>,
        after: &Completion,
    ) -> Result<TransferHandle<T>, CoreError> {
        if buffer.is_empty() {
            return Ok(TransferHandle::ready(Vec::new()));
        }
        self.ctx.note_readback(buffer.size_bytes());
        match &self.ctx.backend {
            ContextBackend::Host(host) => {
                let store = buffer.host_store()?.clone();
                let dep = after.clone();
                let (tx, handle) = TransferHandle::pending(self.ctx.clone());
                host.transfer.enqueue(Box::new(move || {
                    if let Err(e) = dep.wait_blocking() {
                        tx.finish(Err(e));
                        return;
                    }
                    let guard = store.read().unwrap_or_else(|e| e.into_inner());
                    tx.finish(Ok(guard.clone()));
                }))?;
                Ok(handle)
            }
            ContextBackend::Gpu(gpu) => {
                // In-queue ordering already places the copy after the gather.
                let rx = gpu.begin_readback(buffer.gpu_buffer()?, buffer.len());
                Ok(TransferHandle::from_receiver(rx, self.ctx.clone()))
            }
        }
    }
}

impl std::fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceQueue")
            .field("context", &self.ctx.id())
            .field("class", &self.ctx.class())
            .finish()
    }
}
