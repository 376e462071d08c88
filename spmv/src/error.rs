use spmv_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),

    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("device failure: {0}")]
    DeviceFailure(#[from] CoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
