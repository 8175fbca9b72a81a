//! Operation records and status types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parameter key under which the claiming worker id is stored.
///
/// This is the only link between the worker registry and the
/// operations store. There is no foreign key, only convention.
pub const WORKER_ID_PARAM: &str = "worker_id";

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Created but not yet picked up.
    Pending,
    /// Currently executing on a worker (or locally).
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped before completion.
    Cancelled,
}

impl OperationStatus {
    /// Returns true if the status is final. Terminal statuses are
    /// sticky: the store refuses to overwrite them.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Whether the claiming worker has confirmed an operation.
///
/// Orthogonal to [`OperationStatus`]: a record can be `Running` while
/// the backend is still waiting for the worker to acknowledge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    /// The claiming worker has confirmed this operation.
    #[default]
    Confirmed,
    /// The durable record exists but worker confirmation is pending.
    PendingReconciliation,
}

/// One unit of dispatched work, tracked by id across its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Globally unique id, generated by whichever side creates the record.
    pub operation_id: String,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Worker-confirmation flag.
    pub reconciliation_status: ReconciliationStatus,
    /// False for backend-local operations, which the orphan detector skips.
    pub distributed: bool,
    /// Untyped passthrough bag. The claiming worker id lives under
    /// [`WORKER_ID_PARAM`] by convention.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Result payload for completed operations.
    pub result: Option<Value>,
    /// Error message for failed operations.
    pub error_message: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl OperationRecord {
    /// Creates a new pending record.
    #[must_use]
    pub fn new(operation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            operation_id: operation_id.into(),
            status: OperationStatus::Pending,
            reconciliation_status: ReconciliationStatus::default(),
            distributed: false,
            parameters: Map::new(),
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the record as distributed (eligible for orphan detection).
    #[must_use]
    pub const fn distributed(mut self) -> Self {
        self.distributed = true;
        self
    }

    /// Sets the initial status.
    #[must_use]
    pub const fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the reconciliation flag.
    #[must_use]
    pub const fn with_reconciliation(mut self, status: ReconciliationStatus) -> Self {
        self.reconciliation_status = status;
        self
    }

    /// Returns the worker id that claims this operation, if any.
    #[must_use]
    pub fn claimed_worker(&self) -> Option<&str> {
        self.parameters.get(WORKER_ID_PARAM).and_then(Value::as_str)
    }

    /// Records which worker claims this operation.
    pub fn set_claimed_worker(&mut self, worker_id: impl Into<String>) {
        self.parameters
            .insert(WORKER_ID_PARAM.to_owned(), Value::String(worker_id.into()));
    }
}

/// A worker's report of an operation that finished while the backend
/// was unreachable.
///
/// Never persisted on its own: produced worker-side, carried in the
/// registration payload until a registration call succeeds, then
/// discarded. Applying the same report twice is safe because terminal
/// store statuses are sticky.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedOperationReport {
    /// The operation that finished.
    pub operation_id: String,
    /// Terminal status (Completed, Failed, or Cancelled).
    pub status: OperationStatus,
    /// Result payload, if the operation produced one.
    pub result: Option<Value>,
    /// Error message, for failures.
    pub error_message: Option<String>,
    /// When the worker observed completion.
    pub completed_at: DateTime<Utc>,
}

impl CompletedOperationReport {
    /// Creates a completion report with the given terminal status.
    #[must_use]
    pub fn new(operation_id: impl Into<String>, status: OperationStatus) -> Self {
        Self {
            operation_id: operation_id.into(),
            status,
            result: None,
            error_message: None,
            completed_at: Utc::now(),
        }
    }

    /// Attaches a result payload.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Attaches an error message.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}
