use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

/// Internal control-plane error.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A runtime call failed. `retryable` distinguishes transport failures
    /// (connection, timeout) from semantic ones (bad spec, missing image).
    #[error("runtime error: {message}")]
    Runtime { message: String, retryable: bool },

    #[error("invalid state transition {from} -> {to} on container {container_id}")]
    InvalidTransition {
        container_id: String,
        from: String,
        to: String,
    },

    /// A newer transition request replaced this one before it committed.
    #[error("transition superseded on container {0}")]
    TransitionSuperseded(String),

    #[error("container {0} is not tracked")]
    UnknownContainer(String),

    #[error("scaling denied: {0}")]
    ScalingDenied(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("control plane is shutting down")]
    ShuttingDown,
}

impl PoolError {
    /// A transient runtime failure worth retrying at the caller level.
    pub fn transient(message: impl Into<String>) -> Self {
        PoolError::Runtime {
            message: message.into(),
            retryable: true,
        }
    }

    /// A semantic runtime failure that will not succeed on retry.
    pub fn terminal(message: impl Into<String>) -> Self {
        PoolError::Runtime {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Runtime { retryable: true, .. })
    }
}

/// The only error surface visible to job-queue callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("no capacity: {0}")]
    NoCapacity(String),
    #[error("scaling blocked: {0}")]
    ScalingBlocked(String),
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}
