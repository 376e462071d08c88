//! Distributed sparse matrices and the product coordinator.

use futures::future::try_join_all;
use spmv_core::{CoreError, DeviceQueue, Scalar, TransferHandle};

use crate::backend::{split_rows, BackendKind, DevicePart, LocalMatrix};
use crate::error::{Error, Result};
use crate::exchange::{self, DeviceExchange};
use crate::index::ColIndex;
use crate::partition::{make_partition, Partition, PartitionStrategy};
use crate::vector::Vector;

/// Construction knobs for [`SparseMatrix::from_csr_with`].
#[derive(Debug, Clone, Default)]
pub struct MatrixOptions {
    /// How rows are split across the queues.
    pub strategy: PartitionStrategy,
    /// Storage layout for the block-local parts. Defaults to the layout
    /// preferred by each device's class.
    pub backend: Option<BackendKind>,
}

/// What one device holds and moves for a matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub device: usize,
    pub backend: BackendKind,
    pub rows: usize,
    pub local_nonzeros: usize,
    pub remote_nonzeros: usize,
    /// Ghost values this device receives per product.
    pub ghost_count: usize,
    /// Boundary values this device packs and sends per product.
    pub send_count: usize,
}

/// A square sparse matrix distributed by row blocks over device queues.
///
/// Each device holds its block rows split in two: a local part whose columns
/// fall inside the block, and a remote part over the ghost columns owned by
/// other devices. Products start the boundary exchange first and run the
/// local parts while the segments travel.
pub struct SparseMatrix<T: Scalar> {
    n: usize,
    nnz: usize,
    queues: Vec<DeviceQueue>,
    partition: Partition,
    parts: Vec<DevicePart<T>>,
    exchange: Vec<DeviceExchange<T>>,
    /// Owner boundaries into the send set; device `d` fills slots
    /// `cidx[d]..cidx[d + 1]` of every receiver's segments.
    cidx: Vec<usize>,
    send_set_len: usize,
}

impl<T: Scalar> SparseMatrix<T> {
    /// Builds an `n` x `n` matrix from CSR data, split over `queues` with
    /// the default options (measured partition, per-class layouts).
    pub async fn from_csr<O, C>(
        queues: &[DeviceQueue],
        n: usize,
        row_offsets: &[O],
        cols: &[C],
        values: &[T],
    ) -> Result<SparseMatrix<T>>
    where
        O: ColIndex,
        C: ColIndex,
    {
        Self::from_csr_with(queues, n, row_offsets, cols, values, MatrixOptions::default()).await
    }

    /// Builds an `n` x `n` matrix from CSR data.
    ///
    /// The input is validated up front: offsets must start at zero and never
    /// decrease, and every column must land inside the matrix. Bad input is
    /// reported here rather than surfacing later as a wrong product.
    pub async fn from_csr_with<O, C>(
        queues: &[DeviceQueue],
        n: usize,
        row_offsets: &[O],
        cols: &[C],
        values: &[T],
        options: MatrixOptions,
    ) -> Result<SparseMatrix<T>>
    where
        O: ColIndex,
        C: ColIndex,
    {
        if queues.is_empty() {
            return Err(Error::InvalidPartition(
                "at least one device queue is required".to_string(),
            ));
        }
        for queue in queues {
            if !queue.context().supports::<T>() {
                return Err(Error::DeviceFailure(CoreError::Unsupported(format!(
                    "{} kernels are not available on '{}'",
                    std::any::type_name::<T>(),
                    queue.context().name()
                ))));
            }
        }
        if n > u32::MAX as usize {
            return Err(Error::InvalidMatrix(format!(
                "dimension {n} exceeds the device index range"
            )));
        }
        if row_offsets.len() != n + 1 {
            return Err(Error::InvalidMatrix(format!(
                "{} row offsets for dimension {n}",
                row_offsets.len()
            )));
        }

        let mut offsets = Vec::with_capacity(n + 1);
        for (row, raw) in row_offsets.iter().enumerate() {
            let value = raw.as_index().ok_or_else(|| {
                Error::InvalidMatrix(format!("row offset {row} is not a valid index"))
            })?;
            if offsets.last().is_some_and(|&prev| value < prev) {
                return Err(Error::InvalidMatrix(format!(
                    "row offsets decrease at row {row}"
                )));
            }
            offsets.push(value);
        }
        if offsets[0] != 0 {
            return Err(Error::InvalidMatrix(
                "row offsets must start at zero".to_string(),
            ));
        }
        let nnz = offsets[n];
        if cols.len() != nnz || values.len() != nnz {
            return Err(Error::InvalidMatrix(format!(
                "{} columns and {} values for {nnz} entries",
                cols.len(),
                values.len()
            )));
        }
        let mut columns = Vec::with_capacity(nnz);
        for (entry, raw) in cols.iter().enumerate() {
            let col = raw
                .as_index()
                .filter(|&col| col < n)
                .ok_or_else(|| {
                    Error::InvalidMatrix(format!("column out of range at entry {entry}"))
                })?;
            columns.push(col);
        }

        let partition = make_partition::<T>(queues, n, &options.strategy).await?;
        log::debug!("row bounds: {:?}", partition.bounds());
        let ghosts = exchange::ghost_columns(&offsets, &columns, &partition);
        let plan = exchange::plan(&partition, &ghosts);

        let mut parts = Vec::with_capacity(queues.len());
        let mut exchanges = Vec::with_capacity(queues.len());
        for (device, queue) in queues.iter().enumerate() {
            let ghost_list: Vec<usize> = ghosts[device].iter().copied().collect();
            let (local, remote) =
                split_rows(&offsets, &columns, values, partition.range(device), &ghost_list)?;
            let kind = options
                .backend
                .unwrap_or_else(|| BackendKind::for_class(queue.class()));
            let rows = partition.size(device);
            let local_nnz = local.nonzeros();
            let remote_nnz = remote.nonzeros();
            let local = LocalMatrix::build(queue, kind, &local, rows, "matrix local")?;
            // Ghost rows are thin and irregular; padding them would waste
            // most of the layout, so the remote part stays compact.
            let remote = if remote_nnz == 0 {
                None
            } else {
                Some(LocalMatrix::build(
                    queue,
                    BackendKind::CompactRow,
                    &remote,
                    rows,
                    "matrix remote",
                )?)
            };
            parts.push(DevicePart {
                local,
                remote,
                local_nnz,
                remote_nnz,
            });

            let send_range = plan.cidx[device]..plan.cidx[device + 1];
            let send_idx: Vec<u32> = plan.send_set[send_range]
                .iter()
                .map(|&col| (col - partition.start(device)) as u32)
                .collect();
            let positions = exchange::ghost_positions(&ghosts[device], &plan.send_set)?;
            let spans = exchange::recv_spans(&positions, &plan.cidx);
            log::debug!(
                "device {device}: {} ghost column(s) from {} sender(s), {} to send",
                positions.len(),
                spans.len(),
                send_idx.len()
            );
            exchanges.push(DeviceExchange {
                send_idx: queue.upload("exchange send idx", &send_idx)?,
                send_buf: queue.alloc("exchange send", send_idx.len())?,
                rx_buf: queue.alloc("exchange recv", positions.len())?,
                positions,
                spans,
            });
        }

        log::info!(
            "built {n}x{n} matrix with {nnz} nonzeros over {} device(s), {} boundary column(s)",
            queues.len(),
            plan.send_set.len()
        );

        Ok(SparseMatrix {
            n,
            nnz,
            queues: queues.to_vec(),
            partition,
            parts,
            exchange: exchanges,
            cidx: plan.cidx,
            send_set_len: plan.send_set.len(),
        })
    }

    /// y = alpha * A * x, or y += alpha * A * x when `append`.
    ///
    /// Boundary segments are packed and start their readback first; every
    /// device's local product is enqueued behind its gather, so the
    /// segments travel while the local parts run. Each device's remote
    /// product is then enqueued as soon as its own inbound segments are
    /// staged; devices never wait on transfers they do not consume.
    pub async fn mul(&self, x: &Vector<T>, y: &mut Vector<T>, alpha: T, append: bool) -> Result<()> {
        self.check_vector(x)?;
        self.check_vector(y)?;
        let y = &*y;

        // Pack every nonempty boundary segment and start reading it back.
        let mut segments: Vec<Option<TransferHandle<T>>> =
            Vec::with_capacity(self.queues.len());
        for (device, queue) in self.queues.iter().enumerate() {
            let state = &self.exchange[device];
            if state.send_count() == 0 {
                segments.push(None);
                continue;
            }
            let packed = queue.gather(&state.send_idx, x.part(device), &state.send_buf)?;
            segments.push(Some(queue.read_after(&state.send_buf, &packed)?));
        }

        for (device, queue) in self.queues.iter().enumerate() {
            self.parts[device]
                .local
                .spmv(queue, x.part(device), y.part(device), alpha, append)?;
        }
        if self.send_set_len == 0 {
            return Ok(());
        }

        // Per receiver: await only its own senders' segments, stage the
        // ghost values, then run the remote product behind the local one.
        let receivers = (0..self.queues.len()).map(|device| {
            let segments = &segments;
            async move {
                let state = &self.exchange[device];
                if state.ghost_count() == 0 {
                    return Ok(());
                }
                let mut staging = vec![T::zero(); state.ghost_count()];
                for span in &state.spans {
                    let handle = segments[span.sender].as_ref().ok_or_else(|| {
                        Error::Internal(format!(
                            "device {} expects a segment from device {}, which sends nothing",
                            device, span.sender
                        ))
                    })?;
                    let segment = handle.wait().await?;
                    exchange::scatter_segment(
                        &mut staging,
                        span,
                        &state.positions,
                        &segment,
                        self.cidx[span.sender],
                    );
                }
                let queue = &self.queues[device];
                queue.stage_upload(&state.rx_buf, staging)?.wait().await?;
                if let Some(remote) = &self.parts[device].remote {
                    remote.spmv(queue, &state.rx_buf, y.part(device), alpha, true)?;
                }
                Ok::<(), Error>(())
            }
        });
        try_join_all(receivers).await?;
        Ok(())
    }

    /// A zero vector laid out like this matrix's rows.
    pub fn zero_vector(&self) -> Result<Vector<T>> {
        Vector::zeros(&self.queues, self.partition.clone(), "vector")
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
        Vector::from_slice(&self.queues, self.partition.clone(), "vector", data)
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn nonzeros(&self) -> usize {
        self.nnz
    }

    pub fn device_count(&self) -> usize {
        self.queues.len()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Number of distinct columns that cross device boundaries per product.
    pub fn exchanged_columns(&self) -> usize {
        self.send_set_len
    }

    /// Composition of one device's share, or `None` past the last device.
    pub fn device_report(&self, device: usize) -> Option<DeviceReport> {
        let part = self.parts.get(device)?;
        let state = &self.exchange[device];
        Some(DeviceReport {
            device,
            backend: part.local.kind(),
            rows: self.partition.size(device),
            local_nonzeros: part.local_nnz,
            remote_nonzeros: part.remote_nnz,
            ghost_count: state.ghost_count(),
            send_count: state.send_count(),
        })
    }

    fn check_vector(&self, vector: &Vector<T>) -> Result<()> {
        if vector.n() != self.n {
            return Err(Error::DimensionMismatch(format!(
                "vector of dimension {} against a matrix of dimension {}",
                vector.n(),
                self.n
            )));
        }
        if vector.partition() != &self.partition {
            return Err(Error::DimensionMismatch(
                "vector partition differs from the matrix partition".to_string(),
            ));
        }
        for (queue, other) in self.queues.iter().zip(vector.queues()) {
            if !queue.same_context(other) {
                return Err(Error::DimensionMismatch(
                    "vector lives on different devices than the matrix".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_queues(count: usize) -> Vec<DeviceQueue> {
        (0..count).map(|_| DeviceQueue::host().unwrap()).collect()
    }

    // 4x4 tridiagonal-ish matrix used by the validation tests.
    fn small_csr() -> (Vec<u32>, Vec<u32>, Vec<f64>) {
        let row_offsets = vec![0u32, 2, 4, 6, 8];
        let cols = vec![0u32, 1, 0, 1, 2, 3, 2, 3];
        let values = vec![2.0, -1.0, -1.0, 2.0, 2.0, -1.0, -1.0, 2.0];
        (row_offsets, cols, values)
    }

    #[test]
    fn decreasing_offsets_are_rejected() {
        let queues = host_queues(1);
        let err = pollster::block_on(SparseMatrix::from_csr(
            &queues,
            2,
            &[0u32, 3, 2],
            &[0u32, 1, 0],
            &[1.0f64, 2.0, 3.0],
        ));
        assert!(matches!(err, Err(Error::InvalidMatrix(_))));
    }

    #[test]
    fn column_out_of_range_is_rejected() {
        let queues = host_queues(1);
        let err = pollster::block_on(SparseMatrix::from_csr(
            &queues,
            2,
            &[0u32, 1, 2],
            &[0u32, 2],
            &[1.0f64, 2.0],
        ));
        assert!(matches!(err, Err(Error::InvalidMatrix(_))));
    }

    #[test]
    fn negative_column_is_rejected() {
        let queues = host_queues(1);
        let err = pollster::block_on(SparseMatrix::from_csr(
            &queues,
            2,
            &[0i64, 1, 2],
            &[0i64, -1],
            &[1.0f64, 2.0],
        ));
        assert!(matches!(err, Err(Error::InvalidMatrix(_))));
    }

    #[test]
    fn value_length_must_match_offsets() {
        let queues = host_queues(1);
        let (row_offsets, cols, _) = small_csr();
        let err = pollster::block_on(SparseMatrix::from_csr(
            &queues,
            4,
            &row_offsets,
            &cols,
            &[1.0f64; 3],
        ));
        assert!(matches!(err, Err(Error::InvalidMatrix(_))));
    }

    #[test]
    fn explicit_partition_must_cover_the_matrix() {
        let queues = host_queues(2);
        let (row_offsets, cols, values) = small_csr();
        let options = MatrixOptions {
            strategy: PartitionStrategy::Explicit(vec![0, 2, 3]),
            ..MatrixOptions::default()
        };
        let err = pollster::block_on(SparseMatrix::from_csr_with(
            &queues,
            4,
            &row_offsets,
            &cols,
            &values,
            options,
        ));
        assert!(matches!(err, Err(Error::InvalidPartition(_))));
    }

    #[test]
    fn mismatched_vector_is_rejected() {
        let queues = host_queues(1);
        let (row_offsets, cols, values) = small_csr();
        let matrix = pollster::block_on(SparseMatrix::from_csr(
            &queues, 4, &row_offsets, &cols, &values,
        ))
        .unwrap();

        let other = pollster::block_on(SparseMatrix::from_csr(
            &host_queues(1),
            4,
            &row_offsets,
            &cols,
            &values,
        ))
        .unwrap();

        let x = other.vector(&[1.0; 4]).unwrap();
        let mut y = matrix.zero_vector().unwrap();
        let err = pollster::block_on(matrix.mul(&x, &mut y, 1.0, false));
        assert!(matches!(err, Err(Error::DimensionMismatch(_))));
    }

    #[test]
    fn reports_cover_every_device() {
        let queues = host_queues(2);
        let (row_offsets, cols, values) = small_csr();
        let options = MatrixOptions {
            strategy: PartitionStrategy::Explicit(vec![0, 2, 4]),
            ..MatrixOptions::default()
        };
        let matrix = pollster::block_on(SparseMatrix::from_csr_with(
            &queues,
            4,
            &row_offsets,
            &cols,
            &values,
            options,
        ))
        .unwrap();

        // Block diagonal: nothing crosses the cut.
        assert_eq!(matrix.exchanged_columns(), 0);
        for device in 0..2 {
            let report = matrix.device_report(device).unwrap();
            assert_eq!(report.rows, 2);
            assert_eq!(report.local_nonzeros, 4);
            assert_eq!(report.remote_nonzeros, 0);
            assert_eq!(report.ghost_count, 0);
            assert_eq!(report.send_count, 0);
        }
        assert!(matrix.device_report(2).is_none());
    }
}
