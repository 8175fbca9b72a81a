//! Worker-side HTTP server.
//!
//! Three surfaces: the health probe the backend polls, the
//! backend-shutdown notification, and the job dispatch endpoint. All
//! handlers are thin; state changes go through the agent.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::agent::RegistrationAgent;
use crate::executor::{spawn_job, JobExecutor, JobRequest};
use crate::error::WorkerError;

/// Shared worker state.
pub struct WorkerState {
    pub agent: Arc<RegistrationAgent>,
    pub executor: Arc<dyn JobExecutor>,
}

/// Creates the worker router.
pub fn router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/backend-shutdown", post(backend_shutdown))
        .route("/backtests/start", post(start_backtest))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    worker_status: &'static str,
    current_operation: Option<String>,
}

/// Health probe. Every probe stamps the agent's timer; the monitor
/// loop treats a silent backend as one that may have forgotten us.
async fn health(State(state): State<Arc<WorkerState>>) -> Json<HealthResponse> {
    state.agent.record_health_check();

    let current_operation = state.agent.current_operation_id();
    Json(HealthResponse {
        healthy: true,
        worker_status: if current_operation.is_some() {
            "busy"
        } else {
            "idle"
        },
        current_operation,
    })
}

#[derive(Serialize)]
struct ShutdownAck {
    acknowledged: bool,
}

/// Backend shutdown notification. Always acknowledged; the
/// reconnection polling happens off the request path.
async fn backend_shutdown(State(state): State<Arc<WorkerState>>) -> Json<ShutdownAck> {
    info!("backend announced shutdown");
    let agent = state.agent.clone();
    tokio::spawn(agent.reconnect_after_backend_shutdown());
    Json(ShutdownAck { acknowledged: true })
}

#[derive(Serialize)]
struct StartAccepted {
    accepted: bool,
    operation_id: String,
}

#[derive(Serialize)]
struct StartRefused {
    busy: bool,
    current_operation: String,
}

/// Job dispatch. One operation at a time; a busy worker refuses with
/// 503 so the backend tries the next candidate.
async fn start_backtest(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<JobRequest>,
) -> impl IntoResponse {
    match state.agent.begin_operation(&request.operation_id) {
        Ok(cancel) => {
            let operation_id = request.operation_id.clone();
            spawn_job(
                state.agent.clone(),
                state.executor.clone(),
                request,
                cancel,
            );
            (
                StatusCode::ACCEPTED,
                Json(StartAccepted {
                    accepted: true,
                    operation_id,
                }),
            )
                .into_response()
        }
        Err(WorkerError::Busy(current_operation)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StartRefused {
                busy: true,
                current_operation,
            }),
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
