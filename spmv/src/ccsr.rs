//! Clustered matrices.
//!
//! Rows produced by regular discretizations repeat a small set of column
//! patterns. A clustered matrix stores each distinct pattern once, as signed
//! offsets relative to the row index with the values shared alongside, and
//! gives every row a pattern id. Grid operators compress by orders of
//! magnitude this way, at the cost of living on a single device.

use spmv_core::{CcsrDeviceSlice, CoreError, DeviceQueue, Scalar};

use crate::error::{Error, Result};
use crate::index::{ColIndex, PatternOffset};
use crate::partition::Partition;
use crate::vector::Vector;

/// An `n` x `n` clustered matrix on one device queue.
pub struct ClusteredMatrix<T: Scalar> {
    n: usize,
    queue: DeviceQueue,
    partition: Partition,
    slice: CcsrDeviceSlice<T>,
    expanded_nnz: usize,
}

impl<T: Scalar> ClusteredMatrix<T> {
    /// Builds a clustered matrix.
    ///
    /// `patterns[row]` names the pattern of that row; pattern `p` spans
    /// `col_offsets[pattern_offsets[p]..pattern_offsets[p + 1]]`, with the
    /// shared values in the same slots. Every offset is checked against its
    /// rows here: an offset that would reach outside the matrix from any
    /// row using it is rejected up front.
    pub fn from_clustered<P, Q, O>(
        queue: &DeviceQueue,
        n: usize,
        patterns: &[P],
        pattern_offsets: &[Q],
        col_offsets: &[O],
        values: &[T],
    ) -> Result<ClusteredMatrix<T>>
    where
        P: ColIndex,
        Q: ColIndex,
        O: PatternOffset,
    {
        if !queue.context().supports::<T>() {
            return Err(Error::DeviceFailure(CoreError::Unsupported(format!(
                "{} kernels are not available on '{}'",
                std::any::type_name::<T>(),
                queue.context().name()
            ))));
        }
        if n > u32::MAX as usize {
            return Err(Error::InvalidMatrix(format!(
                "dimension {n} exceeds the device index range"
            )));
        }
        if patterns.len() != n {
            return Err(Error::InvalidMatrix(format!(
                "{} pattern ids for dimension {n}",
                patterns.len()
            )));
        }
        if pattern_offsets.is_empty() {
            return Err(Error::InvalidMatrix(
                "pattern offsets must at least hold a leading zero".to_string(),
            ));
        }

        let mut offsets = Vec::with_capacity(pattern_offsets.len());
        for (pattern, raw) in pattern_offsets.iter().enumerate() {
            let value = raw.as_index().ok_or_else(|| {
                Error::InvalidMatrix(format!("pattern offset {pattern} is not a valid index"))
            })?;
            if offsets.last().is_some_and(|&prev| value < prev) {
                return Err(Error::InvalidMatrix(format!(
                    "pattern offsets decrease at pattern {pattern}"
                )));
            }
            offsets.push(value);
        }
        if offsets[0] != 0 {
            return Err(Error::InvalidMatrix(
                "pattern offsets must start at zero".to_string(),
            ));
        }
        let total = offsets[offsets.len() - 1];
        if col_offsets.len() != total || values.len() != total {
            return Err(Error::InvalidMatrix(format!(
                "{} column offsets and {} values for {total} pattern slots",
                col_offsets.len(),
                values.len()
            )));
        }
        if total > u32::MAX as usize {
            return Err(Error::InvalidMatrix(format!(
                "{total} pattern slots exceed the device index range"
            )));
        }

        let pattern_count = offsets.len() - 1;
        let mut ids = Vec::with_capacity(n);
        for (row, raw) in patterns.iter().enumerate() {
            let id = raw
                .as_index()
                .filter(|&id| id < pattern_count)
                .ok_or_else(|| {
                    Error::InvalidMatrix(format!("row {row} names a pattern that does not exist"))
                })?;
            ids.push(id as u32);
        }

        let mut relative = Vec::with_capacity(total);
        for (slot, raw) in col_offsets.iter().enumerate() {
            let offset = raw.as_offset();
            let narrowed = i32::try_from(offset).map_err(|_| {
                Error::InvalidMatrix(format!("column offset at slot {slot} overflows i32"))
            })?;
            relative.push(narrowed);
        }

        // Every row is checked against its pattern, so a stray offset is
        // caught even when only one row uses the pattern.
        let mut expanded_nnz = 0usize;
        for (row, &id) in ids.iter().enumerate() {
            let span = offsets[id as usize]..offsets[id as usize + 1];
            expanded_nnz += span.len();
            for slot in span {
                let col = row as i64 + i64::from(relative[slot]);
                if col < 0 || col >= n as i64 {
                    return Err(Error::InvalidMatrix(format!(
                        "pattern {id} reaches column {col} from row {row}"
                    )));
                }
            }
        }

        let narrow_offsets: Vec<u32> = offsets.iter().map(|&offset| offset as u32).collect();
        let slice = CcsrDeviceSlice {
            rows: n,
            patterns: queue.upload("clustered patterns", &ids)?,
            pattern_offsets: queue.upload("clustered pattern offsets", &narrow_offsets)?,
            col_offsets: queue.upload("clustered column offsets", &relative)?,
            values: queue.upload("clustered values", values)?,
        };

        log::info!(
            "built {n}x{n} clustered matrix: {pattern_count} pattern(s) standing in for {expanded_nnz} nonzeros"
        );

        Ok(ClusteredMatrix {
            n,
            queue: queue.clone(),
            partition: Partition::single(n),
            slice,
            expanded_nnz,
        })
    }

    /// y = alpha * A * x, or y += alpha * A * x when `append`.
    ///
    /// Single device, so the product is one kernel enqueue; it completes
    /// when `y` is next read.
    pub fn mul(&self, x: &Vector<T>, y: &mut Vector<T>, alpha: T, append: bool) -> Result<()> {
        self.check_vector(x)?;
        self.check_vector(y)?;
        self.queue
            .spmv_ccsr(&self.slice, x.part(0), y.part(0), alpha, append)?;
        Ok(())
    }

    /// A zero vector on this matrix's device.
    pub fn zero_vector(&self) -> Result<Vector<T>> {
        Vector::zeros(
            std::slice::from_ref(&self.queue),
            self.partition.clone(),
            "vector",
        )
    }

    /// A vector initialized from `data`, which must have `n` elements.
    pub fn vector(&self, data: &[T]) -> Result<Vector<T>> {
        if data.len() != self.n {
            return Err(Error::DimensionMismatch(format!(
                "{} elements for a matrix of dimension {}",
                data.len(),
                self.n
            )));
        }
        Vector::from_slice(
            std::slice::from_ref(&self.queue),
            self.partition.clone(),
            "vector",
            data,
        )
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Nonzeros the patterns expand to across all rows.
    pub fn nonzeros(&self) -> usize {
        self.expanded_nnz
    }

    pub fn pattern_count(&self) -> usize {
        self.slice.pattern_offsets.len() - 1
    }

    fn check_vector(&self, vector: &Vector<T>) -> Result<()> {
        if vector.n() != self.n {
            return Err(Error::DimensionMismatch(format!(
                "vector of dimension {} against a matrix of dimension {}",
                vector.n(),
                self.n
            )));
        }
        if vector.partition() != &self.partition
            || !vector.queues()[0].same_context(&self.queue)
        {
            return Err(Error::DimensionMismatch(
                "vector does not live on this matrix's device".to_string(),
            ));
        }
        Ok(())
    }
}
