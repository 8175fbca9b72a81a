//! Error types for the worker agent.

use thiserror::Error;

/// Worker errors.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The backend refused or the call failed after all retries.
    #[error("registration failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The backend is draining and asked us to retry later.
    #[error("backend unavailable")]
    BackendUnavailable,

    /// An operation is already in flight.
    #[error("worker busy with operation {0}")]
    Busy(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    /// Whether another registration attempt is worthwhile. A draining
    /// backend or an unreachable one is transient; anything else is
    /// not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BackendUnavailable => true,
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
