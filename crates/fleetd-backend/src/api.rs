//! HTTP API handlers for the backend.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use fleetd_core::{
    OperationStatus, OperationStore, OperationUpdate, ReconciliationStatus, UpdateOutcome,
};

use crate::dispatch::DispatchService;
use crate::error::BackendError;
use crate::orphan::OrphanDetector;
use crate::registry::{RegisterRequest, WorkerRecord, WorkerRegistry, WorkerStatus, WorkerType};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<WorkerRegistry>,
    pub store: Arc<dyn OperationStore>,
    pub orphan_detector: Arc<OrphanDetector>,
    pub dispatch: Arc<DispatchService>,
    draining: AtomicBool,
}

impl AppState {
    /// Wires the state from its collaborators.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn OperationStore>,
        orphan_detector: Arc<OrphanDetector>,
        dispatch: Arc<DispatchService>,
    ) -> Self {
        Self {
            registry,
            store,
            orphan_detector,
            dispatch,
            draining: AtomicBool::new(false),
        }
    }

    /// Starts refusing new registrations with 503.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Whether the drain flag is set.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Worker registration and lookup
        .route("/workers/register", post(register_worker))
        .route("/workers", get(list_workers))
        .route("/workers/{id}", get(get_worker))
        // Operation completion callbacks
        .route("/operations/{id}/status", post(operation_status))
        // Dispatch
        .route("/backtests", post(start_backtest))
        // Diagnostics
        .route("/orphans/status", get(orphan_status))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint. Ready once at least one worker exists.
async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let workers = state.registry.len();
    let status = if workers > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready: workers > 0,
            workers,
        }),
    )
}

/// Register or re-register a worker.
async fn register_worker(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    if state.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "5")],
            Json(ErrorResponse {
                error: "backend shutting down".to_owned(),
            }),
        )
            .into_response();
    }

    match state.registry.register(request).await {
        Ok(outcome) => Json(RegistrationResponse {
            worker: WorkerResponse::from(outcome.worker),
            stop_operations: outcome.stop_operations,
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "registration failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkersQuery {
    worker_type: Option<String>,
    status: Option<String>,
}

/// List workers, optionally filtered. An unknown filter value matches
/// nothing rather than erroring, so callers can probe for types this
/// backend does not serve.
async fn list_workers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkersQuery>,
) -> Json<Vec<WorkerResponse>> {
    let worker_type = match query.worker_type.as_deref() {
        None => None,
        Some(raw) => match WorkerType::parse(raw) {
            Some(t) => Some(t),
            None => return Json(Vec::new()),
        },
    };
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match WorkerStatus::parse(raw) {
            Some(s) => Some(s),
            None => return Json(Vec::new()),
        },
    };

    let workers = state.registry.list(worker_type, status);
    Json(workers.into_iter().map(WorkerResponse::from).collect())
}

/// Get a specific worker. Workers poll this to detect eviction.
async fn get_worker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkerResponse>, StatusCode> {
    state
        .registry
        .get(&id)
        .map(|w| Json(WorkerResponse::from(w)))
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct StatusCallback {
    status: OperationStatus,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_message: Option<String>,
}

/// Completion callback from a worker.
///
/// Idempotent: a repeated terminal write is acknowledged, never
/// rejected. The claiming worker goes back to the available pool when
/// the reported status is terminal, but only while it still holds
/// this operation: a retried callback arriving after the worker was
/// re-dispatched must not free it mid-flight.
async fn operation_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(callback): Json<StatusCallback>,
) -> impl IntoResponse {
    let Ok(existing) = state.store.get(&id).await else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let Some(existing) = existing else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut update = OperationUpdate::new()
        .status(callback.status)
        .reconciliation(ReconciliationStatus::Confirmed);
    if let Some(result) = callback.result {
        update = update.result(result);
    }
    if let Some(message) = callback.error_message {
        update = update.error(message);
    }

    match state.store.update(&id, update).await {
        Ok(UpdateOutcome::Applied | UpdateOutcome::AlreadyTerminal) => {
            if callback.status.is_terminal() {
                if let Some(worker_id) = existing.claimed_worker() {
                    let still_claimed = state
                        .registry
                        .get(worker_id)
                        .is_some_and(|w| w.current_operation_id.as_deref() == Some(id.as_str()));
                    if still_claimed {
                        state.registry.mark_available(worker_id);
                    }
                }
            }
            info!(operation_id = %id, status = ?callback.status, "operation status updated");
            Json(StatusCallbackResponse { applied: true }).into_response()
        }
        Ok(UpdateOutcome::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(operation_id = %id, error = %e, "status callback failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct BacktestRequest {
    #[serde(default)]
    parameters: Map<String, Value>,
}

/// Dispatch a backtest to an available worker.
async fn start_backtest(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BacktestRequest>,
) -> impl IntoResponse {
    match state
        .dispatch
        .dispatch(WorkerType::Backtesting, request.parameters)
        .await
    {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(
            e @ (BackendError::NoWorkersAvailable { .. } | BackendError::DispatchFailed { .. }),
        ) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "dispatch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Orphan detector snapshot.
async fn orphan_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orphan_detector.status())
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    workers: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct StatusCallbackResponse {
    applied: bool,
}

#[derive(Serialize)]
struct RegistrationResponse {
    worker: WorkerResponse,
    stop_operations: Vec<String>,
}

#[derive(Serialize)]
pub struct WorkerResponse {
    pub worker_id: String,
    pub worker_type: WorkerType,
    pub endpoint_url: String,
    pub status: WorkerStatus,
    pub current_operation_id: Option<String>,
    pub capabilities: Map<String, Value>,
    pub health_check_failures: u32,
    pub registered_at_secs_ago: u64,
    pub last_healthy_secs_ago: u64,
    pub last_health_check_secs_ago: Option<u64>,
    pub last_selected_secs_ago: Option<u64>,
}

impl From<WorkerRecord> for WorkerResponse {
    fn from(w: WorkerRecord) -> Self {
        Self {
            worker_id: w.worker_id,
            worker_type: w.worker_type,
            endpoint_url: w.endpoint_url,
            status: w.status,
            current_operation_id: w.current_operation_id,
            capabilities: w.capabilities,
            health_check_failures: w.health_check_failures,
            registered_at_secs_ago: w.registered_at.elapsed().as_secs(),
            last_healthy_secs_ago: w.last_healthy_at.elapsed().as_secs(),
            last_health_check_secs_ago: w.last_health_check.map(|at| at.elapsed().as_secs()),
            last_selected_secs_ago: w.last_selected.map(|at| at.elapsed().as_secs()),
        }
    }
}
