use std::sync::{Arc, RwLock};

use bytemuck::Pod;

use crate::error::CoreError;

/// Typed buffer living on one device.
///
/// Host devices back it with plain memory behind a lock; GPU devices with a
/// `wgpu::Buffer`. Cloning clones the handle, not the storage.
#[derive(Clone)]
pub struct DeviceBuffer<T: Pod> {
    len: usize,
    pub(crate) inner: BufferInner<T>,
}

#[derive(Clone)]
pub(crate) enum BufferInner<T> {
    Host(Arc<RwLock<Vec<T>>>),
    Gpu(wgpu::Buffer),
}

impl<T: Pod> DeviceBuffer<T> {
    pub(crate) fn host(data: Vec<T>) -> Self {
        DeviceBuffer {
            len: data.len(),
            inner: BufferInner::Host(Arc::new(RwLock::new(data))),
        }
    }

    /// `len` is the element count the buffer represents; the wgpu allocation
    /// may be padded (zero-length buffers keep a minimal backing allocation
    /// so bind groups stay valid).
    pub(crate) fn gpu(buffer: wgpu::Buffer, len: usize) -> Self {
        DeviceBuffer {
            len,
            inner: BufferInner::Gpu(buffer),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the live elements in bytes.
    pub fn size_bytes(&self) -> u64 {
        (self.len * std::mem::size_of::<T>()) as u64
    }

    pub(crate) fn host_store(&self) -> Result<&Arc<RwLock<Vec<T>>>, CoreError> {
        match &self.inner {
            BufferInner::Host(store) => Ok(store),
            BufferInner::Gpu(_) => Err(CoreError::Internal(
                "expected a host buffer, found a GPU buffer".to_string(),
            )),
        }
    }

    pub(crate) fn gpu_buffer(&self) -> Result<&wgpu::Buffer, CoreError> {
        match &self.inner {
            BufferInner::Gpu(buffer) => Ok(buffer),
            BufferInner::Host(_) => Err(CoreError::Internal(
                "expected a GPU buffer, found a host buffer".to_string(),
            )),
        }
    }
}

impl<T: Pod> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.inner {
            BufferInner::Host(_) => "host",
            BufferInner::Gpu(_) => "gpu",
        };
        f.debug_struct("DeviceBuffer")
            .field("len", &self.len)
            .field("backend", &backend)
            .finish()
    }
}
