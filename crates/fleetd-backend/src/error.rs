//! Error types for the backend.

use thiserror::Error;

use crate::registry::WorkerType;

/// Backend errors.
#[derive(Error, Debug)]
pub enum BackendError {
    /// No available worker of the requested type. Carries diagnostic
    /// counts so operators can tell "none ever registered" from "all
    /// busy".
    #[error(
        "no {worker_type:?} workers available ({available} available of {registered} registered)"
    )]
    NoWorkersAvailable {
        /// Requested worker type.
        worker_type: WorkerType,
        /// Workers of that type currently registered.
        registered: usize,
        /// Workers of that type currently available.
        available: usize,
    },

    /// Every tried worker refused or failed the dispatch call.
    #[error("dispatch of {operation_id} failed after trying {attempts} workers")]
    DispatchFailed {
        /// The operation that could not be placed.
        operation_id: String,
        /// Distinct workers tried.
        attempts: usize,
    },

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] fleetd_core::CoreError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;
