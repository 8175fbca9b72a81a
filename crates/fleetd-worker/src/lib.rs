//! Fleetd worker - registration agent, job execution, graceful shutdown.
//!
//! A worker announces itself to the backend, serves the backend's
//! health probes, executes one dispatched job at a time, and exits
//! cleanly when asked. The process is resilient by default: a missing
//! backend is retried and polled for, never a reason to crash, and a
//! completion the backend never heard about is carried in memory
//! until a registration call delivers it.

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod server;
pub mod shutdown;

// Re-export main types
pub use agent::RegistrationAgent;
pub use config::{ReconnectConfig, RegistrationConfig, WorkerConfig};
pub use error::{Result, WorkerError};
pub use executor::{
    CheckpointSink, ExecutionOutcome, InMemoryCheckpointSink, Interrupted, JobExecutor,
    JobRequest, StubExecutor,
};
pub use server::{router, WorkerState};
pub use shutdown::ShutdownCoordinator;
