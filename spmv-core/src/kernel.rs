//! Per-context kernel cache.
//!
//! Compiled kernels and their launch geometry are memoized per compute
//! context, keyed by program name and scalar type. The cache lives on the
//! context object itself, so two contexts (and two tests) never share or
//! cross-contaminate compiled state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::CoreError;

/// Threads per workgroup; must match the `@workgroup_size` in the shaders.
pub const WORKGROUP_SIZE: u32 = 256;

/// Workgroups for `rows` items, capped at the per-dimension dispatch limit.
/// The shaders loop with a grid stride, so the cap only adds iterations.
pub(crate) fn dispatch_size(rows: usize) -> u32 {
    let groups = rows.div_ceil(WORKGROUP_SIZE as usize);
    groups.clamp(1, 65_535) as u32
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct KernelKey {
    pub program: &'static str,
    pub scalar: &'static str,
}

/// One compiled program: every entry point of the shader module, plus the
/// geometry the launch code needs.
pub(crate) struct GpuKernel {
    pub layout: wgpu::BindGroupLayout,
    pub pipelines: HashMap<&'static str, wgpu::ComputePipeline>,
    pub workgroup_size: u32,
}

impl GpuKernel {
    pub(crate) fn pipeline(&self, entry: &str) -> Result<&wgpu::ComputePipeline, CoreError> {
        self.pipelines.get(entry).ok_or_else(|| {
            CoreError::Internal(format!("no compiled entry point '{entry}'"))
        })
    }
}

pub(crate) enum Kernel {
    /// Host kernels carry only their launch width (rows per parallel task).
    Host { chunk: usize },
    Gpu(GpuKernel),
}

impl Kernel {
    pub(crate) fn host_chunk(&self) -> Result<usize, CoreError> {
        match self {
            Kernel::Host { chunk } => Ok(*chunk),
            Kernel::Gpu(_) => Err(CoreError::Internal(
                "host launch requested for a GPU kernel".to_string(),
            )),
        }
    }

    pub(crate) fn gpu(&self) -> Result<&GpuKernel, CoreError> {
        match self {
            Kernel::Gpu(kernel) => Ok(kernel),
            Kernel::Host { .. } => Err(CoreError::Internal(
                "GPU launch requested for a host kernel".to_string(),
            )),
        }
    }
}

pub(crate) struct KernelCache {
    kernels: Mutex<HashMap<KernelKey, Arc<Kernel>>>,
    compiled: AtomicUsize,
}

impl KernelCache {
    pub(crate) fn new() -> Self {
        KernelCache {
            kernels: Mutex::new(HashMap::new()),
            compiled: AtomicUsize::new(0),
        }
    }

    /// Returns the cached kernel for `key`, compiling it with `build` on a
    /// miss. The lock is held across `build`; population is expected from a
    /// single thread (construction / first use).
    pub(crate) fn get_or_compile(
        &self,
        key: KernelKey,
        build: impl FnOnce() -> Result<Kernel, CoreError>,
    ) -> Result<Arc<Kernel>, CoreError> {
        let mut kernels = self.kernels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(kernel) = kernels.get(&key) {
            return Ok(kernel.clone());
        }
        log::debug!("compiling kernel {} for {}", key.program, key.scalar);
        let kernel = Arc::new(build()?);
        self.compiled.fetch_add(1, Ordering::Relaxed);
        kernels.insert(key, kernel.clone());
        Ok(kernel)
    }

    /// Number of distinct programs compiled on this context so far.
    pub(crate) fn compiled_count(&self) -> usize {
        self.compiled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_compiles_each_program_once() {
        let cache = KernelCache::new();
        let key = KernelKey {
            program: "spmv_csr",
            scalar: "f64",
        };

        let first = cache
            .get_or_compile(key, || Ok(Kernel::Host { chunk: 128 }))
            .unwrap();
        let second = cache
            .get_or_compile(key, || {
                panic!("second lookup must not rebuild");
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.compiled_count(), 1);
    }

    #[test]
    fn cache_distinguishes_scalar_types() {
        let cache = KernelCache::new();
        for scalar in ["f32", "f64"] {
            cache
                .get_or_compile(
                    KernelKey {
                        program: "gather",
                        scalar,
                    },
                    || Ok(Kernel::Host { chunk: 64 }),
                )
                .unwrap();
        }
        assert_eq!(cache.compiled_count(), 2);
    }

    #[test]
    fn build_failure_is_not_cached() {
        let cache = KernelCache::new();
        let key = KernelKey {
            program: "spmv_ell",
            scalar: "f32",
        };
        let err = cache.get_or_compile(key, || {
            Err(CoreError::Compile("bad shader".to_string()))
        });
        assert!(err.is_err());
        assert_eq!(cache.compiled_count(), 0);

        cache
            .get_or_compile(key, || Ok(Kernel::Host { chunk: 64 }))
            .unwrap();
        assert_eq!(cache.compiled_count(), 1);
    }
}
