//! Error types for the connection registry.

use thiserror::Error;

use crate::driver::DriverError;

/// Result type alias for registry and connector operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by registry and connector operations.
///
/// An unknown handle is not an error: lookups return `Option`/`bool`.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no suitable driver implemented for server type '{0}'")]
    UnsupportedEngine(String),

    #[error("invalid connection parameters: {0}")]
    InvalidParams(String),

    #[error("fingerprint calculation failed: {0}")]
    Hash(String),

    #[error("error establishing SQL server connection: {0}")]
    Connect(#[source] DriverError),

    #[error("just created SQL connection is unreachable: {0}")]
    Unreachable(#[source] DriverError),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

impl PoolError {
    /// Whether the failure was caused by the caller's input rather than
    /// by the backend or the proxy itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PoolError::UnsupportedEngine(_) | PoolError::InvalidParams(_)
        )
    }
}
