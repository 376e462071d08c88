use thiserror::Error;

/// Device-layer failures. `Clone` so completion handles can fan a failure
/// out to every waiter.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("device initialization failed: {0}")]
    Init(String),

    #[error("kernel compilation failed: {0}")]
    Compile(String),

    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("device queue shut down: {0}")]
    QueueClosed(String),

    #[error("unsupported on this device: {0}")]
    Unsupported(String),

    #[error("internal device error: {0}")]
    Internal(String),
}
