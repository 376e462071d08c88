//! wgpu-backed device context.

use std::sync::Arc;

use bytemuck::Pod;
use futures::channel::oneshot;
use wgpu::util::DeviceExt;
use wgpu::PollType;

use crate::error::CoreError;

pub(crate) struct GpuContext {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
}

impl GpuContext {
    /// Initializes a wgpu context on the preferred adapter.
    pub(crate) async fn new() -> Result<(Self, String), CoreError> {
        log::info!("initializing wgpu context");

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY, // Vulkan, Metal, DX12
            ..Default::default()
        });

        log::debug!("requesting adapter");
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None, // compute only
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| CoreError::Init("no suitable adapter found".to_string()))?;

        let info = adapter.get_info();
        log::info!("selected adapter: {} ({:?})", info.name, info.backend);

        // The widest kernel binds six storage buffers.
        let mut limits = wgpu::Limits::default().using_resolution(adapter.limits());
        limits.max_storage_buffers_per_shader_stage =
            limits.max_storage_buffers_per_shader_stage.max(6);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("spmv-core device"),
                trace: wgpu::Trace::Off,
                memory_hints: wgpu::MemoryHints::Performance,
                required_features: wgpu::Features::empty(),
                required_limits: limits,
            })
            .await
            .map_err(|e| CoreError::Init(format!("failed to request device: {e}")))?;

        log::info!("device and queue obtained");
        Ok((GpuContext { device, queue }, info.name))
    }

    pub(crate) fn create_buffer_with_data(
        &self,
        label: &str,
        contents: &[u8],
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        log::trace!("creating buffer '{}' with {} bytes", label, contents.len());
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            })
    }

    /// Zero-initialized storage buffer. `size_bytes` of zero still allocates
    /// a minimal backing so the buffer can be bound.
    pub(crate) fn create_storage_buffer(&self, label: &str, size_bytes: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size_bytes.max(4),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    /// Copies `buffer` into a staging buffer and starts an asynchronous map;
    /// the returned channel resolves with the data once the device is
    /// polled. The staging buffer travels into the map callback, so the
    /// caller holds no borrow.
    pub(crate) fn begin_readback<T: Pod + Send + 'static>(
        &self,
        buffer: &wgpu::Buffer,
        len: usize,
    ) -> oneshot::Receiver<Result<Vec<T>, CoreError>> {
        let size_bytes = (len * std::mem::size_of::<T>()) as u64;
        let staging = Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size_bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = oneshot::channel();
        let mapped = staging.clone();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let out = match result {
                    Ok(()) => {
                        let data = {
                            let view = mapped.slice(..).get_mapped_range();
                            bytemuck::cast_slice(&view).to_vec()
                        };
                        mapped.unmap();
                        Ok(data)
                    }
                    Err(e) => Err(CoreError::Transfer(format!("buffer mapping failed: {e}"))),
                };
                let _ = tx.send(out);
            });
        rx
    }

    /// Blocks until all submitted work has finished; map callbacks fire
    /// during the poll.
    pub(crate) fn poll_wait(&self) {
        let _ = self.device.poll(PollType::Wait);
    }
}
