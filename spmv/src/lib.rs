//! Sparse matrix-vector products distributed over heterogeneous device
//! queues.
//!
//! A [`SparseMatrix`] splits its rows across any mix of host and GPU queues,
//! sized by a throughput probe unless told otherwise. Products overlap each
//! device's local work with the exchange of boundary values, so a device
//! only ever waits for the ghost columns it actually reads.
//!
//! ```no_run
//! use spmv::{DeviceQueue, SparseMatrix};
//!
//! # async fn demo() -> spmv::Result<()> {
//! let queues = vec![DeviceQueue::host()?, DeviceQueue::gpu().await?];
//!
//! // 2x2 diagonal matrix in CSR form.
//! let a = SparseMatrix::from_csr(&queues, 2, &[0u32, 1, 2], &[0u32, 1], &[3.0f32, 4.0]).await?;
//! let x = a.vector(&[1.0, 1.0])?;
//! let mut y = a.zero_vector()?;
//!
//! y.assign(&a * &x).await?;
//! assert_eq!(y.read_to_vec().await?, vec![3.0, 4.0]);
//! # Ok(())
//! # }
//! ```

mod backend;
mod ccsr;
mod error;
mod exchange;
mod expr;
mod index;
mod matrix;
mod partition;
mod vector;

pub use backend::BackendKind;
pub use ccsr::ClusteredMatrix;
pub use error::{Error, Result};
pub use expr::{Product, ProductSum, VectorExpr};
pub use index::{ColIndex, PatternOffset};
pub use matrix::{DeviceReport, MatrixOptions, SparseMatrix};
pub use partition::{Partition, PartitionStrategy};
pub use vector::Vector;

pub use spmv_core::{CoreError, DeviceClass, DeviceQueue, Scalar, TransferStats};
