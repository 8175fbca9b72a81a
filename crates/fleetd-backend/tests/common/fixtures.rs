//! Test fixtures for backend integration tests.

use fleetd_backend::{RegisterRequest, WorkerType};
use fleetd_core::{CompletedOperationReport, OperationRecord, OperationStatus};
use serde_json::{Map, Value};

/// Builder for creating test registration requests.
pub struct RegistrationBuilder {
    worker_id: String,
    worker_type: WorkerType,
    endpoint_url: String,
    capabilities: Map<String, Value>,
    current_operation_id: Option<String>,
    completed_operations: Vec<CompletedOperationReport>,
}

impl RegistrationBuilder {
    /// Creates a builder for the given worker id.
    pub fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            worker_type: WorkerType::Backtesting,
            endpoint_url: format!("http://{worker_id}:5003"),
            capabilities: Map::new(),
            current_operation_id: None,
            completed_operations: Vec::new(),
        }
    }

    /// Sets the worker type.
    pub fn with_type(mut self, worker_type: WorkerType) -> Self {
        self.worker_type = worker_type;
        self
    }

    /// Sets the endpoint URL.
    pub fn with_endpoint(mut self, endpoint_url: &str) -> Self {
        self.endpoint_url = endpoint_url.to_string();
        self
    }

    /// Adds a capability entry.
    pub fn with_capability(mut self, key: &str, value: Value) -> Self {
        self.capabilities.insert(key.to_string(), value);
        self
    }

    /// Claims an in-flight operation.
    pub fn claiming(mut self, operation_id: &str) -> Self {
        self.current_operation_id = Some(operation_id.to_string());
        self
    }

    /// Attaches a completed-operation report.
    pub fn reporting(mut self, report: CompletedOperationReport) -> Self {
        self.completed_operations.push(report);
        self
    }

    /// Builds the registration request.
    pub fn build(self) -> RegisterRequest {
        RegisterRequest {
            worker_id: self.worker_id,
            worker_type: self.worker_type,
            endpoint_url: self.endpoint_url,
            capabilities: self.capabilities,
            current_operation_id: self.current_operation_id,
            completed_operations: self.completed_operations,
        }
    }
}

/// A running distributed operation record.
pub fn running_operation(operation_id: &str) -> OperationRecord {
    OperationRecord::new(operation_id)
        .distributed()
        .with_status(OperationStatus::Running)
}

/// A completion report for a successful operation.
pub fn completed_report(operation_id: &str) -> CompletedOperationReport {
    CompletedOperationReport::new(operation_id, OperationStatus::Completed)
        .with_result(serde_json::json!({"ok": true}))
}
