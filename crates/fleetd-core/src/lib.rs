//! Shared domain types for fleetd.
//!
//! This crate holds the pieces both sides of the system agree on:
//!
//! - **Operation records**: one unit of dispatched work (a backtest or
//!   training run) tracked by id and status across its lifecycle.
//! - **The operations store**: an opaque async key-value interface the
//!   backend and its background loops read and write through. Terminal
//!   statuses are sticky, which is what makes completion reports safe
//!   to apply more than once.
//! - **Completed-operation reports**: the transient payload a worker
//!   carries for operations that finished while it could not reach the
//!   backend.
//! - **The telemetry sink**: fire-and-forget counters that must never
//!   affect coordination correctness.

pub mod error;
pub mod operation;
pub mod store;
pub mod telemetry;

pub use error::{CoreError, Result};
pub use operation::{
    CompletedOperationReport, OperationRecord, OperationStatus, ReconciliationStatus,
};
pub use store::{
    InMemoryOperationStore, OperationFilter, OperationStore, OperationUpdate, UpdateOutcome,
};
pub use telemetry::{NoopTelemetry, RecordingTelemetry, TelemetryEvent, TelemetrySink};
