//! Sparse kernels: device-resident slice descriptors and the launch paths
//! that run them on either backend.
//!
//! Launches are asynchronous. Host kernels become jobs on the primary lane
//! and run under rayon; GPU kernels are encoded and submitted to the wgpu
//! queue. Ordering within a device follows the primary lane / queue order,
//! so a readback enqueued after a launch observes its result.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::buffer::DeviceBuffer;
use crate::context::ContextBackend;
use crate::error::CoreError;
use crate::event::Completion;
use crate::gpu::GpuContext;
use crate::host;
use crate::kernel::{dispatch_size, GpuKernel, Kernel, KernelKey, WORKGROUP_SIZE};
use crate::queue::DeviceQueue;
use crate::scalar::Scalar;

/// Column marker for unused slots of a padded-column matrix.
pub const ELL_SENTINEL: u32 = u32::MAX;

const ENTRY_SET: &str = "spmv_set";
const ENTRY_ADD: &str = "spmv_add";
const ENTRY_GATHER: &str = "gather";

/// Compact-row slice resident on one device. `row_offsets` has `rows + 1`
/// entries; `cols` and `values` run in row order.
#[derive(Debug, Clone)]
pub struct CsrDeviceSlice<T: Pod> {
    pub rows: usize,
    pub row_offsets: DeviceBuffer<u32>,
    pub cols: DeviceBuffer<u32>,
    pub values: DeviceBuffer<T>,
}

/// Padded-column slice. `cols` and `values` are column-major with `pitch`
/// rows per column; unused slots carry [`ELL_SENTINEL`].
#[derive(Debug, Clone)]
pub struct EllDeviceSlice<T: Pod> {
    pub rows: usize,
    pub width: usize,
    pub pitch: usize,
    pub cols: DeviceBuffer<u32>,
    pub values: DeviceBuffer<T>,
}

/// Clustered slice: each row points at a shared column-offset pattern,
/// offsets are signed and relative to the row index.
#[derive(Debug, Clone)]
pub struct CcsrDeviceSlice<T: Pod> {
    pub rows: usize,
    pub patterns: DeviceBuffer<u32>,
    pub pattern_offsets: DeviceBuffer<u32>,
    pub col_offsets: DeviceBuffer<i32>,
    pub values: DeviceBuffer<T>,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CsrParams {
    rows: u32,
    alpha: f32,
    _padding: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct EllParams {
    rows: u32,
    width: u32,
    pitch: u32,
    alpha: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CcsrParams {
    rows: u32,
    alpha: f32,
    _padding: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GatherParams {
    count: u32,
    _padding: [u32; 3],
}

/// Everything the cache needs to materialize one program: shader source,
/// binding shape (storage buffers in order, params uniform appended last)
/// and the entry points compiled from the module.
struct ProgramSpec {
    name: &'static str,
    source: &'static str,
    storage_read_only: &'static [bool],
    entries: &'static [&'static str],
    params_size: usize,
}

const CSR_PROGRAM: ProgramSpec = ProgramSpec {
    name: "spmv_csr",
    source: include_str!("shaders/spmv_csr.wgsl"),
    storage_read_only: &[true, true, true, true, false],
    entries: &[ENTRY_SET, ENTRY_ADD],
    params_size: mem::size_of::<CsrParams>(),
};

const ELL_PROGRAM: ProgramSpec = ProgramSpec {
    name: "spmv_ell",
    source: include_str!("shaders/spmv_ell.wgsl"),
    storage_read_only: &[true, true, true, false],
    entries: &[ENTRY_SET, ENTRY_ADD],
    params_size: mem::size_of::<EllParams>(),
};

const CCSR_PROGRAM: ProgramSpec = ProgramSpec {
    name: "spmv_ccsr",
    source: include_str!("shaders/spmv_ccsr.wgsl"),
    storage_read_only: &[true, true, true, true, true, false],
    entries: &[ENTRY_SET, ENTRY_ADD],
    params_size: mem::size_of::<CcsrParams>(),
};

const GATHER_PROGRAM: ProgramSpec = ProgramSpec {
    name: "gather",
    source: include_str!("shaders/gather.wgsl"),
    storage_read_only: &[true, true, false],
    entries: &[ENTRY_GATHER],
    params_size: mem::size_of::<GatherParams>(),
};

impl DeviceQueue {
    fn kernel_for<T: Scalar>(&self, spec: &ProgramSpec) -> Result<Arc<Kernel>, CoreError> {
        let key = KernelKey {
            program: spec.name,
            scalar: T::WGSL_NAME,
        };
        let ctx = self.context();
        ctx.kernels.get_or_compile(key, || match &ctx.backend {
            ContextBackend::Host(host) => Ok(Kernel::Host {
                chunk: host.launch_chunk(),
            }),
            ContextBackend::Gpu(gpu) => compile_gpu_program(gpu, spec),
        })
    }

    fn ensure_scalar<T: Scalar>(&self) -> Result<(), CoreError> {
        if self.context().supports::<T>() {
            Ok(())
        } else {
            Err(CoreError::Unsupported(format!(
                "{} kernels are not available on '{}'",
                std::any::type_name::<T>(),
                self.context().name()
            )))
        }
    }

    /// y = alpha * A * x for a compact-row slice, or y += when `append`.
    pub fn spmv_csr<T: Scalar>(
        &self,
        matrix: &CsrDeviceSlice<T>,
        x: &DeviceBuffer<T>,
        y: &DeviceBuffer<T>,
        alpha: T,
        append: bool,
    ) -> Result<(), CoreError> {
        self.ensure_scalar::<T>()?;
        check_output(matrix.rows, y)?;
        if matrix.rows == 0 {
            return Ok(());
        }
        let kernel = self.kernel_for::<T>(&CSR_PROGRAM)?;
        match &self.context().backend {
            ContextBackend::Host(hostctx) => {
                let chunk = kernel.host_chunk()?;
                let row_offsets = matrix.row_offsets.host_store()?.clone();
                let cols = matrix.cols.host_store()?.clone();
                let values = matrix.values.host_store()?.clone();
                let x = checked_input(x, y)?;
                let y = y.host_store()?.clone();
                hostctx.primary.enqueue(Box::new(move || {
                    let row_offsets = row_offsets.read().unwrap_or_else(|e| e.into_inner());
                    let cols = cols.read().unwrap_or_else(|e| e.into_inner());
                    let values = values.read().unwrap_or_else(|e| e.into_inner());
                    let x = x.read().unwrap_or_else(|e| e.into_inner());
                    let mut y = y.write().unwrap_or_else(|e| e.into_inner());
                    host::spmv_csr(&row_offsets, &cols, &values, &x, &mut y, alpha, append, chunk);
                }))?;
            }
            ContextBackend::Gpu(gpu) => {
                let params = CsrParams {
                    rows: matrix.rows as u32,
                    alpha: alpha.to_f32(),
                    _padding: [0; 2],
                };
                launch_gpu(
                    gpu,
                    kernel.gpu()?,
                    entry_for(append),
                    "spmv_csr launch",
                    &[
                        matrix.row_offsets.gpu_buffer()?,
                        matrix.cols.gpu_buffer()?,
                        matrix.values.gpu_buffer()?,
                        x.gpu_buffer()?,
                        y.gpu_buffer()?,
                    ],
                    bytemuck::bytes_of(&params),
                    matrix.rows,
                )?;
            }
        }
        Ok(())
    }

    /// y = alpha * A * x for a padded-column slice, or y += when `append`.
    pub fn spmv_ell<T: Scalar>(
        &self,
        matrix: &EllDeviceSlice<T>,
        x: &DeviceBuffer<T>,
        y: &DeviceBuffer<T>,
        alpha: T,
        append: bool,
    ) -> Result<(), CoreError> {
        self.ensure_scalar::<T>()?;
        check_output(matrix.rows, y)?;
        if matrix.rows == 0 {
            return Ok(());
        }
        let kernel = self.kernel_for::<T>(&ELL_PROGRAM)?;
        match &self.context().backend {
            ContextBackend::Host(hostctx) => {
                let chunk = kernel.host_chunk()?;
                let width = matrix.width;
                let pitch = matrix.pitch;
                let cols = matrix.cols.host_store()?.clone();
                let values = matrix.values.host_store()?.clone();
                let x = checked_input(x, y)?;
                let y = y.host_store()?.clone();
                hostctx.primary.enqueue(Box::new(move || {
                    let cols = cols.read().unwrap_or_else(|e| e.into_inner());
                    let values = values.read().unwrap_or_else(|e| e.into_inner());
                    let x = x.read().unwrap_or_else(|e| e.into_inner());
                    let mut y = y.write().unwrap_or_else(|e| e.into_inner());
                    host::spmv_ell(width, pitch, &cols, &values, &x, &mut y, alpha, append, chunk);
                }))?;
            }
            ContextBackend::Gpu(gpu) => {
                let params = EllParams {
                    rows: matrix.rows as u32,
                    width: matrix.width as u32,
                    pitch: matrix.pitch as u32,
                    alpha: alpha.to_f32(),
                };
                launch_gpu(
                    gpu,
                    kernel.gpu()?,
                    entry_for(append),
                    "spmv_ell launch",
                    &[
                        matrix.cols.gpu_buffer()?,
                        matrix.values.gpu_buffer()?,
                        x.gpu_buffer()?,
                        y.gpu_buffer()?,
                    ],
                    bytemuck::bytes_of(&params),
                    matrix.rows,
                )?;
            }
        }
        Ok(())
    }

    /// y = alpha * A * x for a clustered slice, or y += when `append`.
    pub fn spmv_ccsr<T: Scalar>(
        &self,
        matrix: &CcsrDeviceSlice<T>,
        x: &DeviceBuffer<T>,
        y: &DeviceBuffer<T>,
        alpha: T,
        append: bool,
    ) -> Result<(), CoreError> {
        self.ensure_scalar::<T>()?;
        check_output(matrix.rows, y)?;
        if matrix.rows == 0 {
            return Ok(());
        }
        let kernel = self.kernel_for::<T>(&CCSR_PROGRAM)?;
        match &self.context().backend {
            ContextBackend::Host(hostctx) => {
                let chunk = kernel.host_chunk()?;
                let patterns = matrix.patterns.host_store()?.clone();
                let pattern_offsets = matrix.pattern_offsets.host_store()?.clone();
                let col_offsets = matrix.col_offsets.host_store()?.clone();
                let values = matrix.values.host_store()?.clone();
                let x = checked_input(x, y)?;
                let y = y.host_store()?.clone();
                hostctx.primary.enqueue(Box::new(move || {
                    let patterns = patterns.read().unwrap_or_else(|e| e.into_inner());
                    let pattern_offsets =
                        pattern_offsets.read().unwrap_or_else(|e| e.into_inner());
                    let col_offsets = col_offsets.read().unwrap_or_else(|e| e.into_inner());
                    let values = values.read().unwrap_or_else(|e| e.into_inner());
                    let x = x.read().unwrap_or_else(|e| e.into_inner());
                    let mut y = y.write().unwrap_or_else(|e| e.into_inner());
                    host::spmv_ccsr(
                        &patterns,
                        &pattern_offsets,
                        &col_offsets,
                        &values,
                        &x,
                        &mut y,
                        alpha,
                        append,
                        chunk,
                    );
                }))?;
            }
            ContextBackend::Gpu(gpu) => {
                let params = CcsrParams {
                    rows: matrix.rows as u32,
                    alpha: alpha.to_f32(),
                    _padding: [0; 2],
                };
                launch_gpu(
                    gpu,
                    kernel.gpu()?,
                    entry_for(append),
                    "spmv_ccsr launch",
                    &[
                        matrix.patterns.gpu_buffer()?,
                        matrix.pattern_offsets.gpu_buffer()?,
                        matrix.col_offsets.gpu_buffer()?,
                        matrix.values.gpu_buffer()?,
                        x.gpu_buffer()?,
                        y.gpu_buffer()?,
                    ],
                    bytemuck::bytes_of(&params),
                    matrix.rows,
                )?;
            }
        }
        Ok(())
    }

    /// dst[k] = src[idx[k]], used to pack boundary values for the exchange.
    /// The returned handle completes once the packed values are readable.
    pub fn gather<T: Scalar>(
        &self,
        idx: &DeviceBuffer<u32>,
        src: &DeviceBuffer<T>,
        dst: &DeviceBuffer<T>,
    ) -> Result<Completion, CoreError> {
        self.ensure_scalar::<T>()?;
        if idx.len() != dst.len() {
            return Err(CoreError::Internal(format!(
                "gather of {} indices into a buffer of {}",
                idx.len(),
                dst.len()
            )));
        }
        if idx.is_empty() {
            return Ok(Completion::ready());
        }
        let kernel = self.kernel_for::<T>(&GATHER_PROGRAM)?;
        match &self.context().backend {
            ContextBackend::Host(hostctx) => {
                let idx = idx.host_store()?.clone();
                let src = checked_input(src, dst)?;
                let dst = dst.host_store()?.clone();
                let (tx, completion) = Completion::pending();
                hostctx.primary.enqueue(Box::new(move || {
                    let idx = idx.read().unwrap_or_else(|e| e.into_inner());
                    let src = src.read().unwrap_or_else(|e| e.into_inner());
                    let mut dst = dst.write().unwrap_or_else(|e| e.into_inner());
                    host::gather(&idx, &src, &mut dst);
                    tx.finish(Ok(()));
                }))?;
                Ok(completion)
            }
            ContextBackend::Gpu(gpu) => {
                let params = GatherParams {
                    count: idx.len() as u32,
                    _padding: [0; 3],
                };
                launch_gpu(
                    gpu,
                    kernel.gpu()?,
                    ENTRY_GATHER,
                    "gather launch",
                    &[idx.gpu_buffer()?, src.gpu_buffer()?, dst.gpu_buffer()?],
                    bytemuck::bytes_of(&params),
                    idx.len(),
                )?;
                // Queue order covers later readbacks on this device.
                Ok(Completion::ready())
            }
        }
    }
}

fn entry_for(append: bool) -> &'static str {
    if append {
        ENTRY_ADD
    } else {
        ENTRY_SET
    }
}

fn check_output<T: Pod>(rows: usize, y: &DeviceBuffer<T>) -> Result<(), CoreError> {
    if y.len() == rows {
        Ok(())
    } else {
        Err(CoreError::Internal(format!(
            "output of {} elements for a slice of {} rows",
            y.len(),
            rows
        )))
    }
}

/// Host stores for an input buffer, rejecting aliasing with the output:
/// the launch takes a read lock on inputs and a write lock on the output.
fn checked_input<T: Pod>(
    input: &DeviceBuffer<T>,
    output: &DeviceBuffer<T>,
) -> Result<Arc<std::sync::RwLock<Vec<T>>>, CoreError> {
    let src = input.host_store()?;
    if Arc::ptr_eq(src, output.host_store()?) {
        return Err(CoreError::Internal(
            "input and output buffers alias".to_string(),
        ));
    }
    Ok(src.clone())
}

fn compile_gpu_program(gpu: &GpuContext, spec: &ProgramSpec) -> Result<Kernel, CoreError> {
    let module = gpu
        .device
        .create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(spec.name),
            source: wgpu::ShaderSource::Wgsl(spec.source.into()),
        });

    let mut layout_entries: Vec<wgpu::BindGroupLayoutEntry> = spec
        .storage_read_only
        .iter()
        .enumerate()
        .map(|(i, &read_only)| wgpu::BindGroupLayoutEntry {
            binding: i as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect();
    layout_entries.push(wgpu::BindGroupLayoutEntry {
        binding: spec.storage_read_only.len() as u32,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: wgpu::BufferSize::new(spec.params_size as u64),
        },
        count: None,
    });

    let layout = gpu
        .device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(spec.name),
            entries: &layout_entries,
        });
    let pipeline_layout = gpu
        .device
        .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(spec.name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

    let mut pipelines = HashMap::new();
    for &entry in spec.entries {
        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            });
        pipelines.insert(entry, pipeline);
    }

    Ok(Kernel::Gpu(GpuKernel {
        layout,
        pipelines,
        workgroup_size: WORKGROUP_SIZE,
    }))
}

fn launch_gpu(
    gpu: &GpuContext,
    kernel: &GpuKernel,
    entry: &'static str,
    label: &str,
    storage: &[&wgpu::Buffer],
    params: &[u8],
    items: usize,
) -> Result<(), CoreError> {
    let params_buffer = gpu.create_buffer_with_data(
        label,
        params,
        wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    );

    let mut entries: Vec<wgpu::BindGroupEntry> = storage
        .iter()
        .enumerate()
        .map(|(i, buffer)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    entries.push(wgpu::BindGroupEntry {
        binding: storage.len() as u32,
        resource: params_buffer.as_entire_binding(),
    });
    let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout: &kernel.layout,
        entries: &entries,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(kernel.pipeline(entry)?);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(dispatch_size(items), 1, 1);
    }
    gpu.queue.submit(std::iter::once(encoder.finish()));
    Ok(())
}
