//! Fleetd backend - worker registration, health checking, and dispatch.
//!
//! The backend is responsible for:
//!
//! - **Worker registration**: An idempotent upsert that doubles as the
//!   reconciliation point between a worker's live state and the
//!   durable operations store after a restart on either side
//! - **Health monitoring**: Active probing of worker `/health`
//!   endpoints, with eviction of workers that stay unhealthy
//! - **Orphan detection**: Auditing running distributed operations
//!   against live worker claims, failing the ones nobody owns
//! - **Dispatch**: Placing operations on the least-recently-used
//!   available worker of the requested type
//!
//! Registration is worker-initiated: the backend never discovers
//! workers, it only remembers the ones that announce themselves. All
//! state lives in memory behind the registry; the operations store is
//! an injected trait object so deployments can swap the persistence
//! layer without touching coordination logic.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod orphan;
pub mod registry;

// Re-export main types
pub use config::{ApiConfig, BackendConfig, DispatchConfig, HealthConfig, OrphanConfig};
pub use dispatch::{DispatchReceipt, DispatchService, OperationAssignment};
pub use error::{BackendError, Result};
pub use health::HealthMonitor;
pub use orphan::{OrphanDetector, OrphanStatus, SuspectedOperation};
pub use registry::{
    RegisterRequest, RegistrationOutcome, WorkerHealthReport, WorkerId, WorkerRecord,
    WorkerRegistry, WorkerStatus, WorkerType,
};
