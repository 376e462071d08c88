//! Row ownership across devices.
//!
//! A partition is a sorted list of row bounds, one contiguous block per
//! device. Blocks start on [`ROW_ALIGN`] boundaries so padded-column
//! layouts keep their pitch, except for the final bound which is the
//! matrix dimension itself.

use std::ops::Range;
use std::time::Instant;

use spmv_core::{CsrDeviceSlice, DeviceQueue, Scalar};

use crate::error::{Error, Result};

pub const ROW_ALIGN: usize = 16;

const PROBE_DIM: usize = 16;
const PROBE_RUNS: usize = 4;

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// How rows are assigned to devices at construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PartitionStrategy {
    /// Weight devices by a timed reference product (the default). The
    /// measurement is cached on the context, so only the first matrix on
    /// a device pays for it.
    #[default]
    Measured,
    /// Equal row counts.
    Even,
    /// Caller-provided bounds, one more entry than devices, starting at 0
    /// and ending at the matrix dimension.
    Explicit(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    bounds: Vec<usize>,
}

impl Partition {
    pub(crate) fn single(n: usize) -> Partition {
        Partition { bounds: vec![0, n] }
    }

    pub(crate) fn even(n: usize, parts: usize) -> Partition {
        Self::weighted(n, &vec![1.0; parts])
    }

    /// Splits `n` rows proportionally to `weights`, aligning every interior
    /// bound up to [`ROW_ALIGN`].
    pub(crate) fn weighted(n: usize, weights: &[f64]) -> Partition {
        let parts = weights.len();
        let total: f64 = weights.iter().filter(|w| w.is_finite()).sum();
        if total <= 0.0 {
            let ones = vec![1.0; parts];
            return Self::weighted(n, &ones);
        }
        let mut bounds = Vec::with_capacity(parts + 1);
        bounds.push(0);
        let mut cumulative = 0.0;
        for (part, weight) in weights.iter().enumerate() {
            if weight.is_finite() {
                cumulative += weight;
            }
            let bound = if part + 1 == parts {
                n
            } else {
                let raw = (n as f64 * cumulative / total).round() as usize;
                align_up(raw, ROW_ALIGN).min(n)
            };
            bounds.push(bound.max(bounds[part]));
        }
        Partition { bounds }
    }

    pub(crate) fn from_bounds(bounds: Vec<usize>) -> Result<Partition> {
        if bounds.len() < 2 {
            return Err(Error::InvalidPartition(
                "bounds need at least a start and an end".to_string(),
            ));
        }
        if bounds[0] != 0 {
            return Err(Error::InvalidPartition("bounds must start at 0".to_string()));
        }
        if bounds.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(Error::InvalidPartition(
                "bounds must be non-decreasing".to_string(),
            ));
        }
        Ok(Partition { bounds })
    }

    pub fn bounds(&self) -> &[usize] {
        &self.bounds
    }

    pub fn parts(&self) -> usize {
        self.bounds.len() - 1
    }

    /// Total row count covered.
    pub fn n(&self) -> usize {
        self.bounds[self.bounds.len() - 1]
    }

    pub fn start(&self, part: usize) -> usize {
        self.bounds[part]
    }

    pub fn end(&self, part: usize) -> usize {
        self.bounds[part + 1]
    }

    pub fn size(&self, part: usize) -> usize {
        self.end(part) - self.start(part)
    }

    pub fn range(&self, part: usize) -> Range<usize> {
        self.start(part)..self.end(part)
    }

    /// The device owning `row`. Callers keep `row` below `n`.
    pub fn owner_of(&self, row: usize) -> usize {
        self.bounds.partition_point(|&bound| bound <= row) - 1
    }
}

pub(crate) async fn make_partition<T: Scalar>(
    queues: &[DeviceQueue],
    n: usize,
    strategy: &PartitionStrategy,
) -> Result<Partition> {
    match strategy {
        PartitionStrategy::Measured => {
            if queues.len() == 1 {
                return Ok(Partition::single(n));
            }
            let mut weights = Vec::with_capacity(queues.len());
            for queue in queues {
                weights.push(probe_weight::<T>(queue).await?);
            }
            Ok(Partition::weighted(n, &weights))
        }
        PartitionStrategy::Even => Ok(Partition::even(n, queues.len())),
        PartitionStrategy::Explicit(bounds) => {
            let partition = Partition::from_bounds(bounds.clone())?;
            if partition.parts() != queues.len() {
                return Err(Error::InvalidPartition(format!(
                    "{} bound ranges for {} devices",
                    partition.parts(),
                    queues.len()
                )));
            }
            if partition.n() != n {
                return Err(Error::InvalidPartition(format!(
                    "bounds end at {} for a matrix of dimension {n}",
                    partition.n()
                )));
            }
            Ok(partition)
        }
    }
}

/// Relative device throughput, measured with a seven-point stencil product
/// and cached on the context afterwards.
async fn probe_weight<T: Scalar>(queue: &DeviceQueue) -> Result<f64> {
    let ctx = queue.context();
    if let Some(weight) = ctx.spmv_weight() {
        return Ok(weight);
    }

    let (row_offsets, cols, values) = stencil7::<T>(PROBE_DIM);
    let rows = PROBE_DIM * PROBE_DIM * PROBE_DIM;
    let slice = CsrDeviceSlice {
        rows,
        row_offsets: queue.upload("probe row offsets", &row_offsets)?,
        cols: queue.upload("probe cols", &cols)?,
        values: queue.upload("probe values", &values)?,
    };
    let x = queue.upload("probe x", &vec![T::one(); rows])?;
    let y = queue.alloc::<T>("probe y", rows)?;

    // One untimed run keeps kernel compilation out of the measurement.
    queue.spmv_csr(&slice, &x, &y, T::one(), false)?;
    queue.read_buffer(&y)?.wait().await?;

    let started = Instant::now();
    for _ in 0..PROBE_RUNS {
        queue.spmv_csr(&slice, &x, &y, T::one(), false)?;
    }
    queue.read_buffer(&y)?.wait().await?;
    let elapsed = started.elapsed().as_secs_f64().max(1e-9);

    let weight = PROBE_RUNS as f64 / elapsed;
    log::debug!("device '{}' probe: {weight:.1} products/s", ctx.name());
    Ok(ctx.cache_spmv_weight(weight))
}

/// Seven-point stencil on a cubic grid, the usual reference workload for
/// relative SpMV throughput.
fn stencil7<T: Scalar>(m: usize) -> (Vec<u32>, Vec<u32>, Vec<T>) {
    let n = m * m * m;
    let one = T::one();
    let diag = one + one + one + one + one + one;
    let mut row_offsets = Vec::with_capacity(n + 1);
    let mut cols = Vec::with_capacity(n * 7);
    let mut values = Vec::with_capacity(n * 7);
    row_offsets.push(0u32);
    for z in 0..m {
        for y in 0..m {
            for x in 0..m {
                let row = (z * m + y) * m + x;
                if z > 0 {
                    cols.push((row - m * m) as u32);
                    values.push(-one);
                }
                if y > 0 {
                    cols.push((row - m) as u32);
                    values.push(-one);
                }
                if x > 0 {
                    cols.push((row - 1) as u32);
                    values.push(-one);
                }
                cols.push(row as u32);
                values.push(diag);
                if x + 1 < m {
                    cols.push((row + 1) as u32);
                    values.push(-one);
                }
                if y + 1 < m {
                    cols.push((row + m) as u32);
                    values.push(-one);
                }
                if z + 1 < m {
                    cols.push((row + m * m) as u32);
                    values.push(-one);
                }
                row_offsets.push(cols.len() as u32);
            }
        }
    }
    (row_offsets, cols, values)
}
