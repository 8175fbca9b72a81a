//! Fleetd worker binary.
//!
//! Runs the worker agent with the stub executor. Deployments with
//! real business logic embed the library and provide their own
//! [`JobExecutor`](fleetd_worker::JobExecutor).

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetd_worker::{
    router, InMemoryCheckpointSink, RegistrationAgent, ShutdownCoordinator, StubExecutor,
    WorkerConfig, WorkerState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("fleetd_worker=info".parse()?))
        .init();

    info!("Fleetd worker starting");

    // Load configuration
    let config = WorkerConfig::load()?;
    info!(
        worker_id = %config.worker_id,
        worker_type = %config.worker_type,
        backend_url = %config.backend_url,
        "Configuration loaded"
    );

    let listen_addr = config.listen_addr;
    let shutdown_timeout = config.shutdown_timeout;

    // Create agent
    let agent = Arc::new(RegistrationAgent::new(config)?);

    // Initial registration. Failure is logged, not fatal: the backend
    // may simply not be up yet, and the monitor loop keeps trying.
    if let Err(e) = agent.register_with_retry().await {
        warn!(error = %e, "initial registration failed, monitor loop will keep trying");
    }
    agent.start_monitor();

    // Build server state
    let checkpoints = Arc::new(InMemoryCheckpointSink::new());
    let state = Arc::new(WorkerState {
        agent: agent.clone(),
        executor: Arc::new(StubExecutor::new(Duration::from_secs(30))),
    });

    let coordinator = Arc::new(ShutdownCoordinator::new(
        agent.clone(),
        checkpoints,
        shutdown_timeout,
    ));

    // Start HTTP server
    let listener = TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "Worker API listening");

    let shutdown_agent = agent.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            coordinator.wait_and_run().await;
            shutdown_agent.stop_monitor().await;
        })
        .await?;

    info!("Fleetd worker stopped");
    Ok(())
}
