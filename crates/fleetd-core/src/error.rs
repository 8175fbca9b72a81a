//! Error types shared across fleetd crates.

use thiserror::Error;

/// Errors from the core domain layer.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Operation already exists in the store.
    #[error("operation already exists: {0}")]
    OperationAlreadyExists(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
