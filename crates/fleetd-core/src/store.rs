//! Operations storage.
//!
//! The store is treated as an opaque async key-value interface keyed
//! by operation id. The backend, the orphan detector, and HTTP
//! handlers all go through [`OperationStore`]; nothing touches the
//! underlying map directly. The in-memory implementation is the test
//! backend and the default for single-process deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::operation::{OperationRecord, OperationStatus, ReconciliationStatus};

/// Filter criteria for listing operations.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    /// Filter by lifecycle status.
    pub status: Option<OperationStatus>,
    /// Filter by claiming worker id.
    pub worker_id: Option<String>,
    /// Filter by the distributed flag.
    pub distributed: Option<bool>,
}

impl OperationFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: None,
            worker_id: None,
            distributed: None,
        }
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by claiming worker.
    #[must_use]
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Filter by the distributed flag.
    #[must_use]
    pub const fn with_distributed(mut self, distributed: bool) -> Self {
        self.distributed = Some(distributed);
        self
    }
}

/// Partial update applied to an existing operation record.
#[derive(Debug, Clone, Default)]
pub struct OperationUpdate {
    /// New lifecycle status.
    pub status: Option<OperationStatus>,
    /// New reconciliation flag.
    pub reconciliation_status: Option<ReconciliationStatus>,
    /// New claiming worker id.
    pub worker_id: Option<String>,
    /// Result payload.
    pub result: Option<Value>,
    /// Error message.
    pub error_message: Option<String>,
}

impl OperationUpdate {
    /// Create an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lifecycle status.
    #[must_use]
    pub const fn status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the reconciliation flag.
    #[must_use]
    pub const fn reconciliation(mut self, status: ReconciliationStatus) -> Self {
        self.reconciliation_status = Some(status);
        self
    }

    /// Set the claiming worker.
    #[must_use]
    pub fn worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Set the result payload.
    #[must_use]
    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Set the error message.
    #[must_use]
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Outcome of an update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update was applied.
    Applied,
    /// No record with that id exists. A signal, not an error.
    NotFound,
    /// The record already carries a terminal status; the update was
    /// dropped. Re-applying the same terminal status also reports
    /// this, which is what makes completion reports idempotent.
    AlreadyTerminal,
}

/// Backend for storing operation records.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert a new record. Errors if the id already exists.
    async fn create(&self, record: OperationRecord) -> Result<()>;

    /// Get a record by id. `None` if absent.
    async fn get(&self, operation_id: &str) -> Result<Option<OperationRecord>>;

    /// Apply a partial update. A missing id yields
    /// [`UpdateOutcome::NotFound`] rather than an error; a status
    /// change against a terminal record yields
    /// [`UpdateOutcome::AlreadyTerminal`].
    async fn update(&self, operation_id: &str, update: OperationUpdate) -> Result<UpdateOutcome>;

    /// List records matching the filter.
    async fn list(&self, filter: &OperationFilter) -> Result<Vec<OperationRecord>>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, operation_id: &str) -> Result<bool>;
}

fn matches(record: &OperationRecord, filter: &OperationFilter) -> bool {
    if let Some(status) = filter.status {
        if record.status != status {
            return false;
        }
    }
    if let Some(ref worker_id) = filter.worker_id {
        if record.claimed_worker() != Some(worker_id.as_str()) {
            return false;
        }
    }
    if let Some(distributed) = filter.distributed {
        if record.distributed != distributed {
            return false;
        }
    }
    true
}

/// In-memory operation store.
///
/// Data is lost when the process exits; suitable for tests and
/// single-process deployments only.
#[derive(Debug, Default)]
pub struct InMemoryOperationStore {
    operations: RwLock<HashMap<String, OperationRecord>>,
}

impl InMemoryOperationStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn create(&self, record: OperationRecord) -> Result<()> {
        let mut operations = self
            .operations
            .write()
            .map_err(|_| CoreError::internal("lock poisoned"))?;

        let key = record.operation_id.clone();
        if operations.contains_key(&key) {
            return Err(CoreError::OperationAlreadyExists(key));
        }

        operations.insert(key, record);
        Ok(())
    }

    async fn get(&self, operation_id: &str) -> Result<Option<OperationRecord>> {
        let operations = self
            .operations
            .read()
            .map_err(|_| CoreError::internal("lock poisoned"))?;

        Ok(operations.get(operation_id).cloned())
    }

    async fn update(&self, operation_id: &str, update: OperationUpdate) -> Result<UpdateOutcome> {
        let mut operations = self
            .operations
            .write()
            .map_err(|_| CoreError::internal("lock poisoned"))?;

        let Some(record) = operations.get_mut(operation_id) else {
            return Ok(UpdateOutcome::NotFound);
        };

        // Terminal statuses are sticky.
        if record.status.is_terminal() && update.status.is_some() {
            return Ok(UpdateOutcome::AlreadyTerminal);
        }

        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(reconciliation) = update.reconciliation_status {
            record.reconciliation_status = reconciliation;
        }
        if let Some(worker_id) = update.worker_id {
            record.set_claimed_worker(worker_id);
        }
        if let Some(result) = update.result {
            record.result = Some(result);
        }
        if let Some(message) = update.error_message {
            record.error_message = Some(message);
        }
        record.updated_at = Utc::now();

        Ok(UpdateOutcome::Applied)
    }

    async fn list(&self, filter: &OperationFilter) -> Result<Vec<OperationRecord>> {
        let operations = self
            .operations
            .read()
            .map_err(|_| CoreError::internal("lock poisoned"))?;

        let mut results: Vec<_> = operations
            .values()
            .filter(|r| matches(r, filter))
            .cloned()
            .collect();

        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }

    async fn delete(&self, operation_id: &str) -> Result<bool> {
        let mut operations = self
            .operations
            .write()
            .map_err(|_| CoreError::internal("lock poisoned"))?;

        Ok(operations.remove(operation_id).is_some())
    }
}
