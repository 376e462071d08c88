//! Device-local storage of a matrix block.
//!
//! Each device holds its rows twice over: a local part whose columns fall
//! inside the block, renumbered to block-relative indices, and a remote
//! part whose columns are ghost slots into the receive buffer. The local
//! part's layout follows the device class; the remote part stays compact,
//! its pattern is thin and irregular.

use std::ops::Range;

use spmv_core::{
    CsrDeviceSlice, DeviceBuffer, DeviceClass, DeviceQueue, EllDeviceSlice, Scalar, ELL_SENTINEL,
};

use crate::error::{Error, Result};
use crate::partition::{align_up, ROW_ALIGN};

/// Storage layout for the block a device owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Row-offset walks, the layout general-purpose devices iterate well.
    CompactRow,
    /// Column-major slots padded to a common width; wide-SIMD devices
    /// trade the padding for regular access.
    PaddedColumn,
}

impl BackendKind {
    pub(crate) fn for_class(class: DeviceClass) -> BackendKind {
        match class {
            DeviceClass::GeneralPurpose => BackendKind::CompactRow,
            DeviceClass::WideSimd => BackendKind::PaddedColumn,
        }
    }
}

/// Host-side compact arrays for one block, columns already renumbered.
pub(crate) struct SplitSlice<T> {
    pub row_offsets: Vec<u32>,
    pub cols: Vec<u32>,
    pub values: Vec<T>,
}

impl<T> SplitSlice<T> {
    fn with_rows(rows: usize) -> SplitSlice<T> {
        let mut row_offsets = Vec::with_capacity(rows + 1);
        row_offsets.push(0);
        SplitSlice {
            row_offsets,
            cols: Vec::new(),
            values: Vec::new(),
        }
    }

    pub(crate) fn nonzeros(&self) -> usize {
        self.values.len()
    }
}

/// Splits the rows of `range` into a local part (columns inside the block,
/// block-relative) and a remote part (columns as ghost slots).
pub(crate) fn split_rows<T: Scalar>(
    row_offsets: &[usize],
    cols: &[usize],
    values: &[T],
    range: Range<usize>,
    ghosts: &[usize],
) -> Result<(SplitSlice<T>, SplitSlice<T>)> {
    let mut local = SplitSlice::with_rows(range.len());
    let mut remote = SplitSlice::with_rows(range.len());
    for row in range.clone() {
        for j in row_offsets[row]..row_offsets[row + 1] {
            let col = cols[j];
            if range.contains(&col) {
                local.cols.push((col - range.start) as u32);
                local.values.push(values[j]);
            } else {
                let slot = ghosts.binary_search(&col).map_err(|_| {
                    Error::Internal(format!("column {col} missing from ghost set"))
                })?;
                remote.cols.push(slot as u32);
                remote.values.push(values[j]);
            }
        }
        local.row_offsets.push(local.cols.len() as u32);
        remote.row_offsets.push(remote.cols.len() as u32);
    }
    Ok((local, remote))
}

/// Padded-column form of a block: width is the widest row, pitch rounds the
/// row count up to [`ROW_ALIGN`], unused slots carry the sentinel column.
pub(crate) fn padded_columns<T: Scalar>(
    slice: &SplitSlice<T>,
    rows: usize,
) -> (usize, usize, Vec<u32>, Vec<T>) {
    let width = slice
        .row_offsets
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) as usize)
        .max()
        .unwrap_or(0);
    let pitch = align_up(rows, ROW_ALIGN);
    let mut cols = vec![ELL_SENTINEL; width * pitch];
    let mut values = vec![T::zero(); width * pitch];
    for row in 0..rows {
        let first = slice.row_offsets[row] as usize;
        let last = slice.row_offsets[row + 1] as usize;
        for (j, nz) in (first..last).enumerate() {
            cols[row + j * pitch] = slice.cols[nz];
            values[row + j * pitch] = slice.values[nz];
        }
    }
    (width, pitch, cols, values)
}

/// A block in whichever layout the device runs.
pub(crate) enum LocalMatrix<T: Scalar> {
    Csr(CsrDeviceSlice<T>),
    Ell(EllDeviceSlice<T>),
}

impl<T: Scalar> LocalMatrix<T> {
    pub(crate) fn build(
        queue: &DeviceQueue,
        kind: BackendKind,
        slice: &SplitSlice<T>,
        rows: usize,
        label: &str,
    ) -> Result<LocalMatrix<T>> {
        match kind {
            BackendKind::CompactRow => Ok(LocalMatrix::Csr(CsrDeviceSlice {
                rows,
                row_offsets: queue.upload(&format!("{label} row offsets"), &slice.row_offsets)?,
                cols: queue.upload(&format!("{label} cols"), &slice.cols)?,
                values: queue.upload(&format!("{label} values"), &slice.values)?,
            })),
            BackendKind::PaddedColumn => {
                let (width, pitch, cols, values) = padded_columns(slice, rows);
                Ok(LocalMatrix::Ell(EllDeviceSlice {
                    rows,
                    width,
                    pitch,
                    cols: queue.upload(&format!("{label} cols"), &cols)?,
                    values: queue.upload(&format!("{label} values"), &values)?,
                }))
            }
        }
    }

    pub(crate) fn spmv(
        &self,
        queue: &DeviceQueue,
        x: &DeviceBuffer<T>,
        y: &DeviceBuffer<T>,
        alpha: T,
        append: bool,
    ) -> Result<()> {
        match self {
            LocalMatrix::Csr(slice) => queue.spmv_csr(slice, x, y, alpha, append)?,
            LocalMatrix::Ell(slice) => queue.spmv_ell(slice, x, y, alpha, append)?,
        }
        Ok(())
    }

    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            LocalMatrix::Csr(_) => BackendKind::CompactRow,
            LocalMatrix::Ell(_) => BackendKind::PaddedColumn,
        }
    }
}

/// One device's share of the matrix.
pub(crate) struct DevicePart<T: Scalar> {
    pub local: LocalMatrix<T>,
    /// Ghost-column rows; `None` when the block never leaves itself.
    pub remote: Option<LocalMatrix<T>>,
    pub local_nnz: usize,
    pub remote_nnz: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_renumbers_local_and_ghost_columns() {
        // Rows 3..6 of a 6x6 matrix, ghosts {0, 2}.
        let row_offsets = vec![0, 1, 3, 4, 6, 7, 9];
        let cols = vec![0, 1, 4, 2, 3, 0, 4, 5, 2];
        let values: Vec<f64> = (1..=9).map(f64::from).collect();
        let (local, remote) =
            split_rows(&row_offsets, &cols, &values, 3..6, &[0, 2]).unwrap();

        assert_eq!(local.row_offsets, vec![0, 1, 2, 3]);
        assert_eq!(local.cols, vec![0, 1, 2]);
        assert_eq!(local.values, vec![5.0, 7.0, 8.0]);

        assert_eq!(remote.row_offsets, vec![0, 1, 1, 2]);
        assert_eq!(remote.cols, vec![0, 1]);
        assert_eq!(remote.values, vec![6.0, 9.0]);
    }

    #[test]
    fn padded_layout_is_column_major_with_sentinels() {
        let slice = SplitSlice {
            row_offsets: vec![0, 2, 3, 3],
            cols: vec![0, 2, 1],
            values: vec![1.0f32, 2.0, 3.0],
        };
        let (width, pitch, cols, values) = padded_columns(&slice, 3);
        assert_eq!(width, 2);
        assert_eq!(pitch, 16);
        assert_eq!(cols.len(), 32);
        // First column slot per row.
        assert_eq!(cols[0], 0);
        assert_eq!(cols[1], 1);
        assert_eq!(cols[2], ELL_SENTINEL);
        // Second column slot per row.
        assert_eq!(cols[pitch], 2);
        assert_eq!(cols[pitch + 1], ELL_SENTINEL);
        assert_eq!(values[0], 1.0);
        assert_eq!(values[pitch], 2.0);
        assert_eq!(values[pitch + 1], 0.0);
    }

    #[test]
    fn empty_rows_make_a_zero_width_layout() {
        let slice = SplitSlice::<f32> {
            row_offsets: vec![0, 0, 0],
            cols: vec![],
            values: vec![],
        };
        let (width, pitch, cols, values) = padded_columns(&slice, 2);
        assert_eq!(width, 0);
        assert_eq!(pitch, 16);
        assert!(cols.is_empty());
        assert!(values.is_empty());
    }
}
