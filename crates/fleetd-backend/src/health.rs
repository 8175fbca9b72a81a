//! Active worker health checking.
//!
//! A supervised loop probes every registered worker's `/health`
//! endpoint on a fixed interval. Probe results feed the registry's
//! failure bookkeeping; workers that stay unhealthy past the removal
//! grace are evicted at the end of each sweep.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::{BackendError, Result};
use crate::registry::{WorkerHealthReport, WorkerRegistry};

/// Periodic health prober for registered workers.
pub struct HealthMonitor {
    registry: Arc<WorkerRegistry>,
    config: HealthConfig,
    client: reqwest::Client,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Creates a monitor for the given registry.
    pub fn new(registry: Arc<WorkerRegistry>, config: HealthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .map_err(BackendError::Http)?;

        Ok(Self {
            registry,
            config,
            client,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Starts the probe loop. Idempotent; a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let monitor = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            info!(
                interval_secs = monitor.config.probe_interval.as_secs(),
                "health monitor started"
            );
            let mut ticker = tokio::time::interval(monitor.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = monitor.cancel.cancelled() => {
                        info!("health monitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.sweep().await;
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

    /// Probes every registered worker once, then evicts workers whose
    /// unhealthy streak has outlived the removal grace.
    ///
    /// Probes run concurrently; the per-probe client timeout keeps a
    /// hung worker from delaying the rest of the sweep.
    pub async fn sweep(&self) {
        let workers = self.registry.list(None, None);
        if workers.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for worker in workers {
            let client = self.client.clone();
            probes.spawn(async move {
                let result = Self::probe(&client, &worker.endpoint_url).await;
                (worker.worker_id, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((worker_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(report) if report.healthy => {
                    debug!(worker_id = %worker_id, status = %report.worker_status, "probe ok");
                    self.registry.record_probe_success(&worker_id, &report);
                }
                Ok(report) => {
                    warn!(worker_id = %worker_id, status = %report.worker_status, "worker reports unhealthy");
                    self.registry
                        .record_probe_failure(&worker_id, self.config.failure_threshold);
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "probe failed");
                    self.registry
                        .record_probe_failure(&worker_id, self.config.failure_threshold);
                }
            }
        }

        let evicted = self.registry.evict_unhealthy(self.config.removal_grace);
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted unhealthy workers");
        }
    }

    async fn probe(client: &reqwest::Client, endpoint_url: &str) -> Result<WorkerHealthReport> {
        let url = format!("{}/health", endpoint_url.trim_end_matches('/'));
        let response = client.get(&url).send().await?.error_for_status()?;
        Ok(response.json::<WorkerHealthReport>().await?)
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
