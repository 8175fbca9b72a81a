//! Fleetd backend binary.
//!
//! Runs the coordination backend: worker registry, health monitor,
//! orphan detector, and the HTTP API.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetd_backend::{
    api, BackendConfig, DispatchService, HealthMonitor, OrphanDetector, WorkerRegistry,
};
use fleetd_core::{InMemoryOperationStore, NoopTelemetry, OperationStore, TelemetrySink};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("fleetd_backend=info".parse()?),
        )
        .init();

    info!("Fleetd backend starting");

    // Load configuration
    let config = BackendConfig::load()?;
    info!(listen_addr = %config.api.listen_addr, "Configuration loaded");

    let store: Arc<dyn OperationStore> = Arc::new(InMemoryOperationStore::new());
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(NoopTelemetry);

    // Create registry
    let registry = Arc::new(WorkerRegistry::new(store.clone(), telemetry.clone()));
    info!("Worker registry initialised");

    // Create health monitor
    let health_monitor = Arc::new(HealthMonitor::new(registry.clone(), config.health.clone())?);
    info!(
        probe_interval_secs = config.health.probe_interval.as_secs(),
        failure_threshold = config.health.failure_threshold,
        "Health monitor initialised"
    );

    // Create orphan detector
    let orphan_detector = Arc::new(OrphanDetector::new(
        registry.clone(),
        store.clone(),
        telemetry,
        config.orphan.clone(),
    ));
    info!(
        check_interval_secs = config.orphan.check_interval.as_secs(),
        timeout_secs = config.orphan.timeout.as_secs(),
        "Orphan detector initialised"
    );

    // Create dispatch service
    let dispatch = Arc::new(DispatchService::new(
        registry.clone(),
        store.clone(),
        config.dispatch.clone(),
    )?);

    // Build application state
    let state = Arc::new(api::AppState::new(
        registry.clone(),
        store,
        orphan_detector.clone(),
        dispatch,
    ));

    // Start background loops
    health_monitor.start();
    orphan_detector.start();

    // Build router
    let app = api::router(state.clone());

    // Start HTTP server
    let listener = TcpListener::bind(&config.api.listen_addr).await?;
    info!(addr = %config.api.listen_addr, "Backend API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(state, health_monitor, orphan_detector))
        .await?;

    info!("Fleetd backend stopped");
    Ok(())
}

/// Waits for a termination signal, then drains: new registrations get
/// 503, every known worker is told the backend is going away, and the
/// background loops stop before the server closes its listener.
async fn shutdown(
    state: Arc<api::AppState>,
    health_monitor: Arc<HealthMonitor>,
    orphan_detector: Arc<OrphanDetector>,
) {
    wait_for_signal().await;
    info!("shutdown signal received, draining");

    state.begin_drain();
    notify_workers(&state.registry).await;
    health_monitor.stop().await;
    orphan_detector.stop().await;
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

/// Best-effort shutdown notification to every registered worker so
/// their agents switch to reconnection polling instead of timing out.
async fn notify_workers(registry: &WorkerRegistry) {
    let workers = registry.list(None, None);
    if workers.is_empty() {
        return;
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "failed to build shutdown-notification client");
            return;
        }
    };

    let mut notifications = JoinSet::new();
    for worker in workers {
        let client = client.clone();
        notifications.spawn(async move {
            let url = format!(
                "{}/backend-shutdown",
                worker.endpoint_url.trim_end_matches('/')
            );
            if let Err(e) = client.post(&url).send().await {
                warn!(worker_id = %worker.worker_id, error = %e, "shutdown notification failed");
            }
        });
    }
    while notifications.join_next().await.is_some() {}

    info!("workers notified of shutdown");
}
