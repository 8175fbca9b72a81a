//! Job execution boundary.
//!
//! The agent and server are business-logic agnostic: everything they
//! know about the actual work goes through [`JobExecutor`], and
//! everything about durable intermediate state goes through
//! [`CheckpointSink`]. The stub implementations here exist for tests
//! and the demo binary.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetd_core::{CompletedOperationReport, OperationStatus};

use crate::agent::RegistrationAgent;
use crate::error::Result;

/// A job assignment from the backend. The id is backend-generated;
/// the worker never mints operation ids for dispatched work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Backend-generated operation id.
    pub operation_id: String,
    /// Untyped job parameters, passed through verbatim.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Why an execution stopped before producing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The worker is shutting down. The shutdown path owns the
    /// checkpoint and the cancellation report; the executor must not
    /// write a failure on top of them.
    GracefulShutdown,
}

/// Outcome of one job execution.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Finished successfully with a result payload.
    Completed(Value),
    /// Finished with an error.
    Failed(String),
    /// Stopped before completion.
    Interrupted(Interrupted),
}

/// Business-logic boundary for executing jobs.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Runs the job to completion or until the token is cancelled.
    async fn execute(&self, request: &JobRequest, cancel: &CancellationToken) -> ExecutionOutcome;
}

/// Sink for durable intermediate state.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Persists one tagged checkpoint for an operation.
    async fn save(&self, operation_id: &str, tag: &str, state: Value) -> Result<()>;
}

/// In-memory checkpoint sink.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointSink {
    checkpoints: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryCheckpointSink {
    /// Create a new empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a saved checkpoint, if present.
    #[must_use]
    pub fn get(&self, operation_id: &str, tag: &str) -> Option<Value> {
        self.checkpoints
            .read()
            .get(operation_id)
            .and_then(|tags| tags.get(tag))
            .cloned()
    }
}

#[async_trait]
impl CheckpointSink for InMemoryCheckpointSink {
    async fn save(&self, operation_id: &str, tag: &str, state: Value) -> Result<()> {
        self.checkpoints
            .write()
            .entry(operation_id.to_owned())
            .or_default()
            .insert(tag.to_owned(), state);
        Ok(())
    }
}

/// Executor that pretends to work for a fixed duration, yielding to
/// cancellation. Stands in for real business logic in tests and the
/// demo binary.
#[derive(Debug)]
pub struct StubExecutor {
    duration: Duration,
}

impl StubExecutor {
    /// Creates a stub that "works" for the given duration.
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl JobExecutor for StubExecutor {
    async fn execute(&self, request: &JobRequest, cancel: &CancellationToken) -> ExecutionOutcome {
        tokio::select! {
            () = cancel.cancelled() => ExecutionOutcome::Interrupted(Interrupted::GracefulShutdown),
            () = tokio::time::sleep(self.duration) => ExecutionOutcome::Completed(serde_json::json!({
                "operation_id": request.operation_id,
                "simulated": true,
            })),
        }
    }
}

/// Runs one job on a spawned task: executes, reports the outcome, and
/// releases the agent.
///
/// An interrupted execution reports nothing here; the shutdown path
/// already checkpointed and reported the cancellation.
pub fn spawn_job(
    agent: Arc<RegistrationAgent>,
    executor: Arc<dyn JobExecutor>,
    request: JobRequest,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let operation_id = request.operation_id.clone();
        info!(operation_id = %operation_id, "job started");

        let outcome = executor.execute(&request, &cancel).await;

        match outcome {
            ExecutionOutcome::Completed(result) => {
                agent
                    .report_completion(
                        CompletedOperationReport::new(&operation_id, OperationStatus::Completed)
                            .with_result(result),
                    )
                    .await;
                agent.finish_operation(&operation_id);
            }
            ExecutionOutcome::Failed(message) => {
                warn!(operation_id = %operation_id, error = %message, "job failed");
                agent
                    .report_completion(
                        CompletedOperationReport::new(&operation_id, OperationStatus::Failed)
                            .with_error(message),
                    )
                    .await;
                agent.finish_operation(&operation_id);
            }
            ExecutionOutcome::Interrupted(Interrupted::GracefulShutdown) => {
                info!(operation_id = %operation_id, "job interrupted by shutdown");
            }
        }
    });
}
