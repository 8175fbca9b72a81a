//! Integration tests for the registration agent against a stub backend.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use fleetd_core::{CompletedOperationReport, OperationStatus};
use fleetd_worker::{RegistrationAgent, WorkerConfig, WorkerError};

/// In-process stand-in for the coordination backend.
struct StubBackend {
    addr: SocketAddr,
    /// Registration payloads that reached the backend.
    registrations: Mutex<Vec<Value>>,
    /// How many upcoming registration calls to refuse with 503.
    refuse_next: AtomicUsize,
    /// Whether `GET /workers/{id}` finds the worker.
    knows_worker: AtomicBool,
    /// Stop list to include in registration replies.
    stop_operations: Mutex<Vec<String>>,
    /// Captured status callbacks as (operation_id, body).
    status_reports: Mutex<Vec<(String, Value)>>,
}

impl StubBackend {
    async fn spawn() -> Arc<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stub = Arc::new(Self {
            addr,
            registrations: Mutex::new(Vec::new()),
            refuse_next: AtomicUsize::new(0),
            knows_worker: AtomicBool::new(true),
            stop_operations: Mutex::new(Vec::new()),
            status_reports: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/workers/register", post(register))
            .route("/workers/{id}", get(get_worker))
            .route("/operations/{id}/status", post(operation_status))
            .with_state(stub.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        stub
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }
}

async fn register(
    State(stub): State<Arc<StubBackend>>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    if stub
        .refuse_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    stub.registrations.lock().push(payload);
    Json(serde_json::json!({
        "worker": {},
        "stop_operations": stub.stop_operations.lock().clone(),
    }))
    .into_response()
}

async fn get_worker(
    State(stub): State<Arc<StubBackend>>,
    Path(_id): Path<String>,
) -> impl IntoResponse {
    if stub.knows_worker.load(Ordering::SeqCst) {
        Json(serde_json::json!({})).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn operation_status(
    State(stub): State<Arc<StubBackend>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    stub.status_reports.lock().push((id, body));
    StatusCode::OK
}

fn fast_config(backend_url: &str) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.worker_id = "bt-worker-1".to_owned();
    config.backend_url = backend_url.to_owned();
    config.endpoint_url = "http://bt-worker-1:5003".to_owned();
    config.registration.max_retries = 3;
    config.registration.initial_backoff = Duration::from_millis(10);
    config.registration.max_backoff = Duration::from_millis(40);
    config.monitor_interval = Duration::from_millis(20);
    config.health_check_timeout = Duration::from_millis(50);
    config.reconnect.poll_interval = Duration::from_millis(20);
    config.reconnect.max_duration = Duration::from_millis(500);
    config
}

#[tokio::test]
async fn registration_carries_identity_and_state() {
    let stub = StubBackend::spawn().await;
    let mut config = fast_config(&stub.url());
    config
        .capabilities
        .insert("cores".to_owned(), serde_json::json!(8));
    let agent = RegistrationAgent::new(config).unwrap();

    agent.begin_operation("op-42").unwrap();
    agent.queue_report(
        CompletedOperationReport::new("op-41", OperationStatus::Completed)
            .with_result(serde_json::json!({"ok": true})),
    );

    agent.register().await.unwrap();

    let registrations = stub.registrations.lock();
    let payload = &registrations[0];
    assert_eq!(payload["worker_id"], "bt-worker-1");
    assert_eq!(payload["worker_type"], "backtesting");
    assert_eq!(payload["endpoint_url"], "http://bt-worker-1:5003");
    assert_eq!(payload["capabilities"]["cores"], 8);
    assert_eq!(payload["current_operation_id"], "op-42");
    assert_eq!(payload["completed_operations"][0]["operation_id"], "op-41");
}

#[tokio::test]
async fn retry_rides_out_a_draining_backend() {
    let stub = StubBackend::spawn().await;
    stub.refuse_next.store(2, Ordering::SeqCst);

    let agent = RegistrationAgent::new(fast_config(&stub.url())).unwrap();
    agent.register_with_retry().await.unwrap();

    assert_eq!(stub.registration_count(), 1);
}

#[tokio::test]
async fn retries_exhaust_without_crashing() {
    let stub = StubBackend::spawn().await;
    stub.refuse_next.store(10, Ordering::SeqCst);

    let agent = RegistrationAgent::new(fast_config(&stub.url())).unwrap();
    let err = agent.register_with_retry().await.unwrap_err();

    assert!(matches!(
        err,
        WorkerError::RetriesExhausted { attempts: 3 }
    ));
    assert_eq!(stub.registration_count(), 0);
}

#[tokio::test]
async fn reports_survive_failed_registrations() {
    let stub = StubBackend::spawn().await;
    stub.refuse_next.store(1, Ordering::SeqCst);

    let agent = RegistrationAgent::new(fast_config(&stub.url())).unwrap();
    agent.queue_report(CompletedOperationReport::new(
        "op-1",
        OperationStatus::Failed,
    ));

    // First call fails; the report must not be lost.
    let err = agent.register().await.unwrap_err();
    assert!(matches!(err, WorkerError::BackendUnavailable));
    assert_eq!(agent.pending_report_count(), 1);

    // Second call delivers it, exactly once.
    agent.register().await.unwrap();
    assert_eq!(agent.pending_report_count(), 0);

    let registrations = stub.registrations.lock();
    assert_eq!(registrations.len(), 1);
    assert_eq!(
        registrations[0]["completed_operations"][0]["operation_id"],
        "op-1"
    );
}

#[tokio::test]
async fn stop_list_cancels_the_matching_operation() {
    let stub = StubBackend::spawn().await;
    stub.stop_operations.lock().push("op-1".to_owned());

    let agent = RegistrationAgent::new(fast_config(&stub.url())).unwrap();
    let token = agent.begin_operation("op-1").unwrap();

    let stops = agent.register().await.unwrap();

    assert_eq!(stops, vec!["op-1".to_owned()]);
    assert!(token.is_cancelled());
    assert!(agent.current_operation_id().is_none());
}

#[tokio::test]
async fn stop_list_for_another_operation_is_ignored() {
    let stub = StubBackend::spawn().await;
    stub.stop_operations.lock().push("op-9".to_owned());

    let agent = RegistrationAgent::new(fast_config(&stub.url())).unwrap();
    let token = agent.begin_operation("op-1").unwrap();

    agent.register().await.unwrap();

    assert!(!token.is_cancelled());
    assert_eq!(agent.current_operation_id().as_deref(), Some("op-1"));
}

#[tokio::test]
async fn monitor_reregisters_when_no_probe_ever_arrives() {
    // The backend restarted right after dispatching us and never
    // probed; the worker must notice on its own.
    let stub = StubBackend::spawn().await;
    stub.knows_worker.store(false, Ordering::SeqCst);

    let agent = Arc::new(RegistrationAgent::new(fast_config(&stub.url())).unwrap());
    agent.start_monitor();
    sleep(Duration::from_millis(150)).await;
    agent.stop_monitor().await;

    assert!(stub.registration_count() >= 1);
}

#[tokio::test]
async fn recent_probe_keeps_the_monitor_quiet() {
    let stub = StubBackend::spawn().await;

    let mut config = fast_config(&stub.url());
    config.health_check_timeout = Duration::from_secs(60);
    let agent = Arc::new(RegistrationAgent::new(config).unwrap());

    agent.record_health_check();
    agent.start_monitor();
    sleep(Duration::from_millis(100)).await;
    agent.stop_monitor().await;

    assert_eq!(stub.registration_count(), 0);
}

#[tokio::test]
async fn reconnect_polls_until_the_backend_returns() {
    let stub = StubBackend::spawn().await;
    stub.refuse_next.store(2, Ordering::SeqCst);

    let agent = Arc::new(RegistrationAgent::new(fast_config(&stub.url())).unwrap());
    agent.clone().reconnect_after_backend_shutdown().await;

    assert_eq!(stub.registration_count(), 1);
    // A successful reconnect counts as contact, resetting the
    // missed-probe clock.
    assert!(agent.last_health_check().is_some());
}

#[tokio::test]
async fn completion_report_reaches_the_status_endpoint() {
    let stub = StubBackend::spawn().await;
    let agent = RegistrationAgent::new(fast_config(&stub.url())).unwrap();

    agent
        .report_completion(
            CompletedOperationReport::new("op-1", OperationStatus::Completed)
                .with_result(serde_json::json!({"sharpe": 2.1})),
        )
        .await;

    let reports = stub.status_reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "op-1");
    assert_eq!(reports[0].1["status"], "completed");
    assert_eq!(reports[0].1["result"]["sharpe"], 2.1);
    assert_eq!(agent.pending_report_count(), 0);
}
