//! Worker registry and registration-time reconciliation.
//!
//! The registry is the in-memory source of truth for which workers
//! exist and which are available. Registration is an idempotent
//! upsert that doubles as the reconciliation point after a restart on
//! either side: the worker's live report of "what I am doing" is
//! compared against the durable operations store, the store is
//! brought in line, and the worker is told which operations to
//! abandon.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use fleetd_core::{
    CompletedOperationReport, CoreError, OperationRecord, OperationStatus, OperationStore,
    OperationUpdate, ReconciliationStatus, TelemetryEvent, TelemetrySink, UpdateOutcome,
};

use crate::error::Result;

/// Unique worker identifier.
pub type WorkerId = String;

/// The kind of work a worker executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    /// Strategy backtesting executor.
    Backtesting,
    /// CPU-bound model training.
    CpuTraining,
    /// GPU-hosted model training.
    GpuTraining,
}

impl WorkerType {
    /// Parses the snake_case wire representation. `None` for unknown
    /// strings; list filters treat that as "matches nothing".
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backtesting" => Some(Self::Backtesting),
            "cpu_training" => Some(Self::CpuTraining),
            "gpu_training" => Some(Self::GpuTraining),
            _ => None,
        }
    }
}

/// Worker availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Idle and eligible for selection.
    Available,
    /// Executing an operation.
    Busy,
    /// Failed consecutive health checks; excluded from selection
    /// until it recovers or the cleanup sweep removes it.
    TemporarilyUnavailable,
}

impl WorkerStatus {
    /// Parses the snake_case wire representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(Self::Available),
            "busy" => Some(Self::Busy),
            "temporarily_unavailable" => Some(Self::TemporarilyUnavailable),
            _ => None,
        }
    }
}

/// One registered worker.
///
/// Invariant: `status == Busy` iff `current_operation_id.is_some()`.
/// All mutation goes through [`WorkerRegistry`] methods, which
/// maintain it.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Unique, caller-supplied id (typically hostname-derived).
    pub worker_id: WorkerId,
    /// Kind of work this worker executes.
    pub worker_type: WorkerType,
    /// HTTP base URL other components use to reach this worker.
    pub endpoint_url: String,
    /// Availability status.
    pub status: WorkerStatus,
    /// Operation currently claimed by this worker.
    pub current_operation_id: Option<String>,
    /// Untyped passthrough bag (cores, memory, gpu flags). Not
    /// schema-enforced; informational only.
    pub capabilities: Map<String, Value>,
    /// Time of the last probe, successful or not.
    pub last_health_check: Option<Instant>,
    /// Time of the last successful probe or registration.
    pub last_healthy_at: Instant,
    /// Consecutive probe failures; reset to 0 on success.
    pub health_check_failures: u32,
    /// Last time `select()` returned this worker.
    pub last_selected: Option<Instant>,
    /// First registration time.
    pub registered_at: Instant,
}

/// Registration payload sent by a worker.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    /// Unique worker id.
    pub worker_id: WorkerId,
    /// Kind of work this worker executes.
    pub worker_type: WorkerType,
    /// HTTP base URL the backend uses to reach the worker.
    pub endpoint_url: String,
    /// Untyped capability bag.
    #[serde(default)]
    pub capabilities: Map<String, Value>,
    /// Operation the worker believes it is currently running.
    #[serde(default)]
    pub current_operation_id: Option<String>,
    /// Operations that finished while the worker could not reach the
    /// backend.
    #[serde(default)]
    pub completed_operations: Vec<CompletedOperationReport>,
}

/// Result of a registration call.
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    /// The upserted worker record.
    pub worker: WorkerRecord,
    /// Operations the worker must abandon: their store-side status is
    /// already terminal.
    pub stop_operations: Vec<String>,
}

/// A worker's self-reported state from its `/health` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealthReport {
    /// Whether the worker considers itself healthy.
    pub healthy: bool,
    /// `"busy"` or `"idle"`.
    pub worker_status: String,
    /// Operation in flight, when busy.
    #[serde(default)]
    pub current_operation: Option<String>,
}

impl WorkerHealthReport {
    fn is_busy(&self) -> bool {
        self.worker_status == "busy" && self.current_operation.is_some()
    }
}

/// Worker registry.
///
/// Backed by a concurrent map; single-record mutations are atomic per
/// entry. Selection additionally holds `select_lock` so the
/// read-oldest / stamp-newest pair cannot interleave with a
/// concurrent selection and hand out the same worker twice.
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, WorkerRecord>,
    select_lock: Mutex<()>,
    store: Arc<dyn OperationStore>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl WorkerRegistry {
    /// Creates an empty registry backed by the given operations store.
    pub fn new(store: Arc<dyn OperationStore>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            workers: DashMap::new(),
            select_lock: Mutex::new(()),
            store,
            telemetry,
        }
    }

    /// Registers or re-registers a worker and reconciles its
    /// self-reported operation state against the operations store.
    ///
    /// Upsert semantics: an existing `worker_id` is updated in place,
    /// never duplicated. The worker's live report wins over stale
    /// store state; the store wins only when it already recorded a
    /// terminal status.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegistrationOutcome> {
        let mut stop_operations = Vec::new();
        let mut busy_with = None;

        if let Some(ref operation_id) = request.current_operation_id {
            if self.reconcile_claim(&request.worker_id, operation_id).await? {
                busy_with = Some(operation_id.clone());
            } else {
                info!(
                    worker_id = %request.worker_id,
                    operation_id = %operation_id,
                    "operation already terminal in store, instructing worker to stop"
                );
                self.telemetry.record(TelemetryEvent::OperationStopped);
                stop_operations.push(operation_id.clone());
            }
        }

        for report in &request.completed_operations {
            self.apply_completed_report(&request.worker_id, report)
                .await?;
        }

        let now = Instant::now();
        let (status, current_operation_id) = match busy_with {
            Some(op) => (WorkerStatus::Busy, Some(op)),
            None => (WorkerStatus::Available, None),
        };

        let worker = match self.workers.entry(request.worker_id.clone()) {
            Entry::Occupied(mut entry) => {
                let worker = entry.get_mut();
                worker.worker_type = request.worker_type;
                worker.endpoint_url = request.endpoint_url;
                worker.capabilities = request.capabilities;
                worker.status = status;
                worker.current_operation_id = current_operation_id;
                worker.health_check_failures = 0;
                worker.last_healthy_at = now;
                self.telemetry.record(TelemetryEvent::WorkerReRegistered);
                worker.clone()
            }
            Entry::Vacant(entry) => {
                self.telemetry.record(TelemetryEvent::WorkerRegistered);
                entry
                    .insert(WorkerRecord {
                        worker_id: request.worker_id.clone(),
                        worker_type: request.worker_type,
                        endpoint_url: request.endpoint_url,
                        status,
                        current_operation_id,
                        capabilities: request.capabilities,
                        last_health_check: None,
                        last_healthy_at: now,
                        health_check_failures: 0,
                        last_selected: None,
                        registered_at: now,
                    })
                    .clone()
            }
        };

        info!(
            worker_id = %worker.worker_id,
            worker_type = ?worker.worker_type,
            status = ?worker.status,
            stop_count = stop_operations.len(),
            "worker registered"
        );

        Ok(RegistrationOutcome {
            worker,
            stop_operations,
        })
    }

    /// Resolves a worker's claim to be running `operation_id`.
    ///
    /// Returns whether the claim stands. A missing store record is
    /// treated the same as a non-terminal one: the worker may have
    /// crashed before the create write landed, so the live report is
    /// trusted and the record is created.
    async fn reconcile_claim(&self, worker_id: &str, operation_id: &str) -> Result<bool> {
        match self.store.get(operation_id).await? {
            Some(record) if record.status.is_terminal() => Ok(false),
            Some(_) => {
                self.store
                    .update(
                        operation_id,
                        OperationUpdate::new()
                            .status(OperationStatus::Running)
                            .reconciliation(ReconciliationStatus::Confirmed)
                            .worker(worker_id),
                    )
                    .await?;
                self.telemetry.record(TelemetryEvent::OperationReconciled);
                Ok(true)
            }
            None => {
                let mut record = OperationRecord::new(operation_id)
                    .distributed()
                    .with_status(OperationStatus::Running);
                record.set_claimed_worker(worker_id);

                match self.store.create(record).await {
                    Ok(()) => {}
                    // Lost a race with a concurrent create; converge via update.
                    Err(CoreError::OperationAlreadyExists(_)) => {
                        self.store
                            .update(
                                operation_id,
                                OperationUpdate::new()
                                    .status(OperationStatus::Running)
                                    .reconciliation(ReconciliationStatus::Confirmed)
                                    .worker(worker_id),
                            )
                            .await?;
                    }
                    Err(e) => return Err(e.into()),
                }
                self.telemetry.record(TelemetryEvent::OperationReconciled);
                Ok(true)
            }
        }
    }

    /// Writes one completed-operation report to the store.
    ///
    /// Idempotent: an already-terminal record reports
    /// [`UpdateOutcome::AlreadyTerminal`] and the re-apply is dropped.
    async fn apply_completed_report(
        &self,
        worker_id: &str,
        report: &CompletedOperationReport,
    ) -> Result<()> {
        if !report.status.is_terminal() {
            warn!(
                operation_id = %report.operation_id,
                status = ?report.status,
                "completion report with non-terminal status, skipping"
            );
            return Ok(());
        }

        let mut update = OperationUpdate::new()
            .status(report.status)
            .reconciliation(ReconciliationStatus::Confirmed);
        if let Some(ref result) = report.result {
            update = update.result(result.clone());
        }
        if let Some(ref message) = report.error_message {
            update = update.error(message.clone());
        }

        match self.store.update(&report.operation_id, update).await? {
            UpdateOutcome::Applied => {}
            UpdateOutcome::AlreadyTerminal => {
                debug!(
                    operation_id = %report.operation_id,
                    "completion report re-applied, store already terminal"
                );
            }
            UpdateOutcome::NotFound => {
                // The create write never landed; materialise the record
                // directly in its terminal state.
                let mut record = OperationRecord::new(&report.operation_id)
                    .distributed()
                    .with_status(report.status);
                record.set_claimed_worker(worker_id);
                record.result = report.result.clone();
                record.error_message = report.error_message.clone();
                match self.store.create(record).await {
                    Ok(()) | Err(CoreError::OperationAlreadyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(())
    }

    /// Gets a worker by id.
    #[must_use]
    pub fn get(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers.get(worker_id).map(|r| r.clone())
    }

    /// Lists workers, optionally filtered by type and status.
    #[must_use]
    pub fn list(
        &self,
        worker_type: Option<WorkerType>,
        status: Option<WorkerStatus>,
    ) -> Vec<WorkerRecord> {
        self.workers
            .iter()
            .filter(|r| worker_type.is_none_or(|t| r.worker_type == t))
            .filter(|r| status.is_none_or(|s| r.status == s))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Selects the least-recently-used available worker of the type.
    ///
    /// `None` is the normal capacity-exhausted outcome, not an error.
    /// The selected worker's `last_selected` is stamped as a side
    /// effect, under the selection lock, so concurrent selections
    /// cannot both pick the same least-recently-used worker.
    #[must_use]
    pub fn select(&self, worker_type: WorkerType) -> Option<WorkerRecord> {
        self.select_excluding(worker_type, &HashSet::new())
    }

    /// Like [`select`](Self::select), skipping the given worker ids.
    #[must_use]
    pub fn select_excluding(
        &self,
        worker_type: WorkerType,
        exclude: &HashSet<WorkerId>,
    ) -> Option<WorkerRecord> {
        let _guard = self.select_lock.lock();

        let mut best: Option<(WorkerId, Option<Instant>)> = None;
        for entry in self.workers.iter() {
            let worker = entry.value();
            if worker.worker_type != worker_type
                || worker.status != WorkerStatus::Available
                || exclude.contains(entry.key())
            {
                continue;
            }
            let older = match &best {
                None => true,
                Some((_, current)) => less_recent(worker.last_selected, *current),
            };
            if older {
                best = Some((entry.key().clone(), worker.last_selected));
            }
        }

        let (worker_id, _) = match best {
            Some(found) => found,
            None => {
                self.telemetry.record(TelemetryEvent::SelectionExhausted);
                return None;
            }
        };

        let selected = self.workers.get_mut(&worker_id).map(|mut worker| {
            worker.last_selected = Some(Instant::now());
            worker.clone()
        });

        if selected.is_some() {
            self.telemetry.record(TelemetryEvent::SelectionHit);
        }
        selected
    }

    /// Marks a worker busy with an operation. No-op for unknown ids;
    /// the worker may have been evicted concurrently.
    pub fn mark_busy(&self, worker_id: &str, operation_id: impl Into<String>) {
        if let Some(mut worker) = self.workers.get_mut(worker_id) {
            worker.status = WorkerStatus::Busy;
            worker.current_operation_id = Some(operation_id.into());
        }
    }

    /// Marks a worker available. No-op for unknown ids.
    pub fn mark_available(&self, worker_id: &str) {
        if let Some(mut worker) = self.workers.get_mut(worker_id) {
            worker.status = WorkerStatus::Available;
            worker.current_operation_id = None;
        }
    }

    /// Applies a successful probe: resets the failure counter and
    /// reconciles status from the worker's self-report, which is
    /// authoritative over the registry's cached guess.
    pub fn record_probe_success(&self, worker_id: &str, report: &WorkerHealthReport) {
        if let Some(mut worker) = self.workers.get_mut(worker_id) {
            let now = Instant::now();
            worker.health_check_failures = 0;
            worker.last_health_check = Some(now);
            worker.last_healthy_at = now;

            if report.is_busy() {
                worker.status = WorkerStatus::Busy;
                worker.current_operation_id = report.current_operation.clone();
            } else {
                worker.status = WorkerStatus::Available;
                worker.current_operation_id = None;
            }
        }
    }

    /// Applies a failed probe. At `threshold` consecutive failures
    /// the worker is marked temporarily unavailable and its claim is
    /// dropped, leaving the orphan detector to audit the operation.
    pub fn record_probe_failure(&self, worker_id: &str, threshold: u32) {
        if let Some(mut worker) = self.workers.get_mut(worker_id) {
            worker.health_check_failures += 1;
            worker.last_health_check = Some(Instant::now());

            if worker.health_check_failures >= threshold
                && worker.status != WorkerStatus::TemporarilyUnavailable
            {
                warn!(
                    worker_id = %worker_id,
                    failures = worker.health_check_failures,
                    "worker marked temporarily unavailable"
                );
                worker.status = WorkerStatus::TemporarilyUnavailable;
                worker.current_operation_id = None;
            }
        }
    }

    /// Removes workers that have been unhealthy longer than `grace`.
    ///
    /// Ids are collected before any removal so the sweep never
    /// mutates the map while iterating a live view of it.
    pub fn evict_unhealthy(&self, grace: std::time::Duration) -> Vec<WorkerId> {
        let stale: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|r| {
                r.status == WorkerStatus::TemporarilyUnavailable
                    && r.last_healthy_at.elapsed() > grace
            })
            .map(|r| r.key().clone())
            .collect();

        for worker_id in &stale {
            self.workers.remove(worker_id);
            self.telemetry.record(TelemetryEvent::WorkerEvicted);
            info!(worker_id = %worker_id, "evicted unhealthy worker");
        }

        stale
    }

    /// Removes a worker outright. Returns whether it existed.
    pub fn remove(&self, worker_id: &str) -> bool {
        self.workers.remove(worker_id).is_some()
    }

    /// Operation ids currently claimed by registered workers.
    #[must_use]
    pub fn claimed_operations(&self) -> HashSet<String> {
        self.workers
            .iter()
            .filter_map(|r| r.current_operation_id.clone())
            .collect()
    }

    /// Registered and available counts for a worker type, for
    /// capacity-exhaustion diagnostics.
    #[must_use]
    pub fn capacity_counts(&self, worker_type: WorkerType) -> (usize, usize) {
        let mut registered = 0;
        let mut available = 0;
        for entry in self.workers.iter() {
            if entry.worker_type == worker_type {
                registered += 1;
                if entry.status == WorkerStatus::Available {
                    available += 1;
                }
            }
        }
        (registered, available)
    }

    /// Number of registered workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if no workers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

/// Ordering for `last_selected`: a never-selected worker is older
/// than any selected one.
fn less_recent(a: Option<Instant>, b: Option<Instant>) -> bool {
    match (a, b) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a < b,
    }
}
