//! Orphaned-operation detection.
//!
//! An operation is orphaned when the store says it is running but no
//! registered worker claims it. The worker may have crashed before
//! reporting, or its claim may have been dropped when it went
//! unhealthy. Either way, only an outside observer can notice the
//! gap, so a supervised loop audits running distributed operations
//! against the registry's live claims.
//!
//! Detection is two-phase. An unclaimed operation is first suspected
//! and given a full timeout window to be re-claimed, because a worker
//! mid-restart legitimately holds no registration for a short while.
//! Only an operation that stays unclaimed past the window is failed.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetd_core::{
    OperationFilter, OperationStatus, OperationStore, OperationUpdate, TelemetryEvent,
    TelemetrySink, UpdateOutcome,
};

use crate::config::OrphanConfig;
use crate::error::Result;
use crate::registry::WorkerRegistry;

/// One operation currently under suspicion.
#[derive(Debug, Clone, Serialize)]
pub struct SuspectedOperation {
    /// The unclaimed operation.
    pub operation_id: String,
    /// How long it has been unclaimed.
    pub suspected_for_secs: u64,
}

/// Snapshot of detector state, for the diagnostics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanStatus {
    /// Whether the sweep loop is running.
    pub running: bool,
    /// Operations currently in the suspicion window.
    pub suspected: Vec<SuspectedOperation>,
    /// Seconds since the last completed sweep, if any.
    pub last_check_secs_ago: Option<u64>,
    /// Configured suspicion window.
    pub timeout_secs: u64,
}

/// Periodic auditor of running distributed operations.
pub struct OrphanDetector {
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn OperationStore>,
    telemetry: Arc<dyn TelemetrySink>,
    config: OrphanConfig,
    suspicion: DashMap<String, Instant>,
    last_check: Mutex<Option<Instant>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OrphanDetector {
    /// Creates a detector over the given registry and store.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn OperationStore>,
        telemetry: Arc<dyn TelemetrySink>,
        config: OrphanConfig,
    ) -> Self {
        Self {
            registry,
            store,
            telemetry,
            config,
            suspicion: DashMap::new(),
            last_check: Mutex::new(None),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Starts the sweep loop. Idempotent; a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let detector = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            info!(
                interval_secs = detector.config.check_interval.as_secs(),
                timeout_secs = detector.config.timeout.as_secs(),
                "orphan detector started"
            );
            let mut ticker = tokio::time::interval(detector.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = detector.cancel.cancelled() => {
                        info!("orphan detector stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = detector.sweep().await {
                            warn!(error = %e, "orphan sweep failed");
                        }
                    }
                }
            }
        }));
    }

    /// Stops the loop and waits for the current sweep to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Audits running distributed operations against live claims.
    ///
    /// Local operations never enter the audit: with no worker
    /// involved there is no claim to lose.
    pub async fn sweep(&self) -> Result<()> {
        let running = self
            .store
            .list(
                &OperationFilter::new()
                    .with_status(OperationStatus::Running)
                    .with_distributed(true),
            )
            .await?;

        let running_ids: HashSet<&str> = running.iter().map(|r| r.operation_id.as_str()).collect();

        // Drop suspicion for operations that reached a terminal state
        // through the normal path since the last sweep.
        self.suspicion
            .retain(|operation_id, _| running_ids.contains(operation_id.as_str()));

        let claimed = self.registry.claimed_operations();

        for record in &running {
            if claimed.contains(&record.operation_id) {
                if self.suspicion.remove(&record.operation_id).is_some() {
                    info!(
                        operation_id = %record.operation_id,
                        "suspected operation re-claimed, clearing suspicion"
                    );
                }
                continue;
            }

            let first_unclaimed = *self
                .suspicion
                .entry(record.operation_id.clone())
                .or_insert_with(|| {
                    warn!(
                        operation_id = %record.operation_id,
                        "running operation has no claiming worker, suspecting"
                    );
                    self.telemetry.record(TelemetryEvent::OrphanSuspected);
                    Instant::now()
                });

            if first_unclaimed.elapsed() >= self.config.timeout {
                self.fail_orphan(&record.operation_id).await?;
            }
        }

        *self.last_check.lock() = Some(Instant::now());
        Ok(())
    }

    async fn fail_orphan(&self, operation_id: &str) -> Result<()> {
        let message = format!(
            "operation orphaned: no worker claimed it within {}s",
            self.config.timeout.as_secs()
        );
        let outcome = self
            .store
            .update(
                operation_id,
                OperationUpdate::new()
                    .status(OperationStatus::Failed)
                    .error(message),
            )
            .await?;

        self.suspicion.remove(operation_id);

        match outcome {
            UpdateOutcome::Applied => {
                warn!(operation_id = %operation_id, "orphaned operation failed");
                self.telemetry.record(TelemetryEvent::OrphanFailed);
            }
            // The operation finished or was removed between the list
            // and the write; nothing to do.
            UpdateOutcome::AlreadyTerminal | UpdateOutcome::NotFound => {}
        }

        Ok(())
    }

    /// Current detector state, for diagnostics.
    #[must_use]
    pub fn status(&self) -> OrphanStatus {
        let mut suspected: Vec<SuspectedOperation> = self
            .suspicion
            .iter()
            .map(|entry| SuspectedOperation {
                operation_id: entry.key().clone(),
                suspected_for_secs: entry.value().elapsed().as_secs(),
            })
            .collect();
        suspected.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));

        OrphanStatus {
            running: self.handle.lock().is_some() && !self.cancel.is_cancelled(),
            suspected,
            last_check_secs_ago: self.last_check.lock().map(|at| at.elapsed().as_secs()),
            timeout_secs: self.config.timeout.as_secs(),
        }
    }
}

impl std::fmt::Debug for OrphanDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanDetector")
            .field("config", &self.config)
            .field("suspected", &self.suspicion.len())
            .finish_non_exhaustive()
    }
}
