//! Graceful worker shutdown.
//!
//! On a termination signal the in-flight operation, if any, gets a
//! checkpoint tagged `"shutdown"` and a cancellation report to the
//! backend. Every step is best-effort: a failure is logged and the
//! process still exits, bounded by the shutdown timeout.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use fleetd_core::{CompletedOperationReport, OperationStatus};

use crate::agent::RegistrationAgent;
use crate::executor::CheckpointSink;

/// Drives graceful shutdown of the worker.
pub struct ShutdownCoordinator {
    agent: Arc<RegistrationAgent>,
    checkpoints: Arc<dyn CheckpointSink>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Creates a coordinator over the agent and checkpoint sink.
    pub fn new(
        agent: Arc<RegistrationAgent>,
        checkpoints: Arc<dyn CheckpointSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            agent,
            checkpoints,
            timeout,
        }
    }

    /// Waits for a termination signal, then shuts down gracefully.
    pub async fn wait_and_run(&self) {
        wait_for_signal().await;
        info!("shutdown signal received");
        self.run().await;
    }

    /// Runs graceful shutdown, bounded by the configured timeout.
    /// When the bound is hit the process exits with whatever cleanup
    /// happened to finish.
    pub async fn run(&self) {
        if tokio::time::timeout(self.timeout, self.graceful())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.timeout.as_secs(),
                "graceful shutdown timed out"
            );
        }
    }

    /// Checkpoint, cancel, report. The checkpoint lands before the
    /// cancel so the executor cannot observe the token and race a
    /// conflicting write into the same slot.
    async fn graceful(&self) {
        let Some((operation_id, cancel)) = self.agent.take_current() else {
            info!("no operation in flight, clean exit");
            return;
        };

        info!(operation_id = %operation_id, "checkpointing in-flight operation");
        if let Err(e) = self
            .checkpoints
            .save(
                &operation_id,
                "shutdown",
                json!({ "reason": "graceful_shutdown" }),
            )
            .await
        {
            warn!(operation_id = %operation_id, error = %e, "shutdown checkpoint failed");
        }

        cancel.cancel();

        self.agent
            .report_completion(
                CompletedOperationReport::new(&operation_id, OperationStatus::Cancelled)
                    .with_error("worker shut down before completion"),
            )
            .await;
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
