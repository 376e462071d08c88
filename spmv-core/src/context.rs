use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::CoreError;
use crate::gpu::GpuContext;
use crate::host::HostContext;
use crate::kernel::KernelCache;
use crate::scalar::Scalar;

/// Coarse device capability class; drives local-format selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceClass {
    /// Cache-friendly, branch-tolerant device (host threads).
    GeneralPurpose,
    /// Wide-SIMD accelerator preferring uniform-stride access (GPU).
    WideSimd,
}

/// Identity of a compute context; distinct contexts never share state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContextId(u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Bytes moved between host memory and device buffers through instrumented
/// paths.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct TransferStats {
    pub bytes_to_device: u64,
    pub bytes_from_device: u64,
}

pub(crate) enum ContextBackend {
    Host(HostContext),
    Gpu(GpuContext),
}

/// One device's long-lived state: handles, the kernel cache, the measured
/// throughput weight, and transfer counters. Everything a kernel launch
/// memoizes hangs off this object, never off process-wide statics.
pub struct ComputeContext {
    id: ContextId,
    class: DeviceClass,
    name: String,
    pub(crate) kernels: KernelCache,
    spmv_weight: OnceLock<f64>,
    bytes_to_device: AtomicU64,
    bytes_from_device: AtomicU64,
    pub(crate) backend: ContextBackend,
}

impl ComputeContext {
    pub(crate) fn new_host() -> Result<Arc<Self>, CoreError> {
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let host = HostContext::new(id.0)?;
        Ok(Arc::new(ComputeContext {
            id,
            class: DeviceClass::GeneralPurpose,
            name: format!("host-{}", id.0),
            kernels: KernelCache::new(),
            spmv_weight: OnceLock::new(),
            bytes_to_device: AtomicU64::new(0),
            bytes_from_device: AtomicU64::new(0),
            backend: ContextBackend::Host(host),
        }))
    }

    pub(crate) async fn new_gpu() -> Result<Arc<Self>, CoreError> {
        let (gpu, adapter_name) = GpuContext::new().await?;
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        Ok(Arc::new(ComputeContext {
            id,
            class: DeviceClass::WideSimd,
            name: adapter_name,
            kernels: KernelCache::new(),
            spmv_weight: OnceLock::new(),
            bytes_to_device: AtomicU64::new(0),
            bytes_from_device: AtomicU64::new(0),
            backend: ContextBackend::Gpu(gpu),
        }))
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    /// Human-readable device name (adapter name on GPU contexts).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether kernels on this device can operate on `T`.
    pub fn supports<T: Scalar>(&self) -> bool {
        match &self.backend {
            ContextBackend::Host(_) => true,
            ContextBackend::Gpu(_) => T::GPU_CAPABLE,
        }
    }

    /// Number of distinct kernel programs compiled on this context.
    pub fn compiled_kernel_count(&self) -> usize {
        self.kernels.compiled_count()
    }

    /// Measured relative SpMV throughput, if a benchmark ran on this context.
    pub fn spmv_weight(&self) -> Option<f64> {
        self.spmv_weight.get().copied()
    }

    /// Stores a measured throughput weight; the first stored value wins and
    /// is returned thereafter.
    pub fn cache_spmv_weight(&self, weight: f64) -> f64 {
        *self.spmv_weight.get_or_init(|| weight)
    }

    pub fn transfer_stats(&self) -> TransferStats {
        TransferStats {
            bytes_to_device: self.bytes_to_device.load(Ordering::Relaxed),
            bytes_from_device: self.bytes_from_device.load(Ordering::Relaxed),
        }
    }

    pub fn reset_transfer_stats(&self) {
        self.bytes_to_device.store(0, Ordering::Relaxed);
        self.bytes_from_device.store(0, Ordering::Relaxed);
    }

    pub(crate) fn note_upload(&self, bytes: u64) {
        self.bytes_to_device.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn note_readback(&self, bytes: u64) {
        self.bytes_from_device.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Lets pending asynchronous work make progress. GPU contexts block on
    /// the device poll so map callbacks fire; host lanes need no driving.
    pub(crate) fn drive(&self) {
        if let ContextBackend::Gpu(gpu) = &self.backend {
            gpu.poll_wait();
        }
    }

}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("name", &self.name)
            .finish()
    }
}
