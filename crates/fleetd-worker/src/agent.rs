//! Registration agent.
//!
//! The agent owns the worker's relationship with the backend: it
//! announces the worker, re-announces it whenever the backend seems
//! to have forgotten us, and carries completion reports that could
//! not be delivered while the backend was unreachable.
//!
//! Registration doubles as reconciliation. The payload always
//! includes the operation currently in flight and any queued
//! completion reports, so a single successful call brings a restarted
//! backend fully up to date about this worker.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetd_core::CompletedOperationReport;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct RegistrationPayload {
    worker_id: String,
    worker_type: String,
    endpoint_url: String,
    capabilities: Map<String, Value>,
    current_operation_id: Option<String>,
    completed_operations: Vec<CompletedOperationReport>,
}

#[derive(Debug, Deserialize)]
struct RegistrationReply {
    #[serde(default)]
    stop_operations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    status: fleetd_core::OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
}

struct CurrentOperation {
    operation_id: String,
    cancel: CancellationToken,
}

/// Maintains this worker's registration with the backend.
pub struct RegistrationAgent {
    config: WorkerConfig,
    client: reqwest::Client,
    last_health_check: Mutex<Option<Instant>>,
    pending_reports: Mutex<Vec<CompletedOperationReport>>,
    current: Mutex<Option<CurrentOperation>>,
    reconnecting: AtomicBool,
    cancel: CancellationToken,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RegistrationAgent {
    /// Creates an agent for the given configuration.
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(WorkerError::Http)?;

        Ok(Self {
            config,
            client,
            last_health_check: Mutex::new(None),
            pending_reports: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            monitor_handle: Mutex::new(None),
        })
    }

    /// This worker's id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Stamps the health-check timer. Called by the `/health` handler
    /// on every backend probe.
    pub fn record_health_check(&self) {
        *self.last_health_check.lock() = Some(Instant::now());
    }

    /// Time of the last backend health check, if any was ever received.
    #[must_use]
    pub fn last_health_check(&self) -> Option<Instant> {
        *self.last_health_check.lock()
    }

    /// Claims the agent for a new operation.
    ///
    /// Every operation gets a fresh cancellation token, so a shutdown
    /// signal aimed at a previous operation can never leak into this
    /// one. Fails when an operation is already in flight.
    pub fn begin_operation(&self, operation_id: &str) -> Result<CancellationToken> {
        let mut current = self.current.lock();
        if let Some(ref existing) = *current {
            return Err(WorkerError::Busy(existing.operation_id.clone()));
        }

        let cancel = CancellationToken::new();
        *current = Some(CurrentOperation {
            operation_id: operation_id.to_owned(),
            cancel: cancel.clone(),
        });
        Ok(cancel)
    }

    /// Releases the agent after an operation ends. No-op if another
    /// operation has taken over in the meantime.
    pub fn finish_operation(&self, operation_id: &str) {
        let mut current = self.current.lock();
        if current
            .as_ref()
            .is_some_and(|op| op.operation_id == operation_id)
        {
            *current = None;
        }
    }

    /// Takes the in-flight operation out of the agent, for the
    /// shutdown path.
    #[must_use]
    pub fn take_current(&self) -> Option<(String, CancellationToken)> {
        self.current
            .lock()
            .take()
            .map(|op| (op.operation_id, op.cancel))
    }

    /// The operation currently in flight, if any.
    #[must_use]
    pub fn current_operation_id(&self) -> Option<String> {
        self.current.lock().as_ref().map(|op| op.operation_id.clone())
    }

    /// Queues a completion report for the next registration.
    pub fn queue_report(&self, report: CompletedOperationReport) {
        self.pending_reports.lock().push(report);
    }

    /// Number of queued completion reports.
    #[must_use]
    pub fn pending_report_count(&self) -> usize {
        self.pending_reports.lock().len()
    }

    /// Registers this worker with the backend.
    ///
    /// Queued completion reports ride along and are dropped only
    /// after the call succeeds; a failed call leaves them queued for
    /// the next attempt. The backend's stop list is applied by
    /// cancelling the matching in-flight operation.
    pub async fn register(&self) -> Result<Vec<String>> {
        let reports = self.pending_reports.lock().clone();
        let payload = RegistrationPayload {
            worker_id: self.config.worker_id.clone(),
            worker_type: self.config.worker_type.clone(),
            endpoint_url: self.config.endpoint_url.clone(),
            capabilities: self.config.capabilities.clone(),
            current_operation_id: self.current_operation_id(),
            completed_operations: reports.clone(),
        };

        let url = format!("{}/workers/register", self.backend_url());
        let response = self.client.post(&url).json(&payload).send().await?;

        if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(WorkerError::BackendUnavailable);
        }
        let reply: RegistrationReply = response.error_for_status()?.json().await?;

        // The delivered reports are done; reports queued while the
        // call was in flight stay for the next round.
        if !reports.is_empty() {
            let delivered: Vec<&str> = reports.iter().map(|r| r.operation_id.as_str()).collect();
            self.pending_reports
                .lock()
                .retain(|r| !delivered.contains(&r.operation_id.as_str()));
        }

        self.record_health_check();

        for operation_id in &reply.stop_operations {
            self.stop_operation(operation_id);
        }

        info!(
            worker_id = %self.config.worker_id,
            stop_count = reply.stop_operations.len(),
            "registered with backend"
        );
        Ok(reply.stop_operations)
    }

    fn stop_operation(&self, operation_id: &str) {
        let mut current = self.current.lock();
        if let Some(ref op) = *current {
            if op.operation_id == operation_id {
                warn!(
                    operation_id = %operation_id,
                    "backend says operation is already terminal, cancelling"
                );
                op.cancel.cancel();
                *current = None;
            }
        }
    }

    /// Registers with exponential backoff and jitter.
    ///
    /// A draining backend (503) is retried exactly like an
    /// unreachable one. Exhaustion is an error the caller logs, never
    /// a reason to crash the worker.
    pub async fn register_with_retry(&self) -> Result<Vec<String>> {
        let retry = &self.config.registration;
        let mut backoff = retry.initial_backoff;

        for attempt in 1..=retry.max_retries {
            match self.register().await {
                Ok(stops) => return Ok(stops),
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    let delay = backoff + jitter(backoff);
                    warn!(
                        attempt,
                        max = retry.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "registration attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    backoff = (backoff * 2).min(retry.max_backoff);
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "final registration attempt failed");
                    return Err(WorkerError::RetriesExhausted {
                        attempts: retry.max_retries,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Err(WorkerError::RetriesExhausted {
            attempts: retry.max_retries,
        })
    }

    /// Confirms the backend still knows this worker; re-registers on
    /// 404. An evicted worker discovers its eviction this way.
    pub async fn ensure_registered(&self) -> Result<()> {
        let url = format!("{}/workers/{}", self.backend_url(), self.config.worker_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            info!(
                worker_id = %self.config.worker_id,
                "backend does not know us, re-registering"
            );
            self.register_with_retry().await?;
            return Ok(());
        }

        response.error_for_status()?;
        Ok(())
    }

    /// Starts the missed-health-check monitor. Idempotent.
    ///
    /// The monitor fires when no health check has EVER been received,
    /// not only when a previously healthy stream stops: a backend
    /// that restarted before its first probe would otherwise never
    /// find us again.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut handle = self.monitor_handle.lock();
        if handle.is_some() {
            return;
        }

        let agent = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            info!(
                interval_secs = agent.config.monitor_interval.as_secs(),
                "health-check monitor started"
            );
            let mut ticker = tokio::time::interval(agent.config.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a freshly
            // started worker gets a full timeout window.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = agent.cancel.cancelled() => {
                        info!("health-check monitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let stale = match agent.last_health_check() {
                            None => true,
                            Some(at) => at.elapsed() > agent.config.health_check_timeout,
                        };
                        if stale {
                            warn!("no recent backend health check, verifying registration");
                            if let Err(e) = agent.ensure_registered().await {
                                warn!(error = %e, "re-registration check failed");
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Stops the monitor loop.
    pub async fn stop_monitor(&self) {
        self.cancel.cancel();
        let handle = self.monitor_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Polls for the backend to come back after it announced its own
    /// shutdown. Bounded; when the window closes the regular monitor
    /// loop takes over. Only one polling loop runs at a time.
    pub async fn reconnect_after_backend_shutdown(self: Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let deadline = Instant::now() + self.config.reconnect.max_duration;
        info!(
            poll_secs = self.config.reconnect.poll_interval.as_secs(),
            "backend announced shutdown, polling for its return"
        );

        loop {
            tokio::time::sleep(self.config.reconnect.poll_interval).await;
            if Instant::now() >= deadline {
                warn!("backend did not return within the reconnection window");
                break;
            }
            match self.register().await {
                Ok(_) => {
                    info!("backend is back, re-registered");
                    break;
                }
                Err(e) => debug!(error = %e, "backend still away"),
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Reports a finished operation to the backend; on failure the
    /// report is queued and rides along with the next registration.
    pub async fn report_completion(&self, report: CompletedOperationReport) {
        let url = format!(
            "{}/operations/{}/status",
            self.backend_url(),
            report.operation_id
        );
        let body = StatusReport {
            status: report.status,
            result: report.result.as_ref(),
            error_message: report.error_message.as_deref(),
        };

        let sent = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response.error_for_status().is_ok(),
            Err(_) => false,
        };

        if sent {
            debug!(operation_id = %report.operation_id, status = ?report.status, "completion reported");
        } else {
            warn!(
                operation_id = %report.operation_id,
                "completion report failed, queueing for next registration"
            );
            self.queue_report(report);
        }
    }

    fn backend_url(&self) -> &str {
        self.config.backend_url.trim_end_matches('/')
    }
}

impl std::fmt::Debug for RegistrationAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationAgent")
            .field("worker_id", &self.config.worker_id)
            .finish_non_exhaustive()
    }
}

fn jitter(base: Duration) -> Duration {
    let quarter = base / 4;
    if quarter.is_zero() {
        return Duration::ZERO;
    }
    let millis = u64::try_from(quarter.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}
