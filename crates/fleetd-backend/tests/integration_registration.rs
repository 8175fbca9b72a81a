//! Integration tests for registration and reconciliation.

mod common;

use common::{
    fixtures::{completed_report, running_operation, RegistrationBuilder},
    TestBackend,
};
use fleetd_backend::WorkerStatus;
use fleetd_core::{
    CompletedOperationReport, OperationRecord, OperationStatus, OperationStore, TelemetryEvent,
};

#[tokio::test]
async fn restarted_backend_rebuilds_registry_from_registrations() {
    // A fresh backend knows nothing; workers re-announcing themselves
    // is the only discovery mechanism.
    let backend = TestBackend::new();
    assert!(backend.registry.is_empty());

    for i in 0..3 {
        backend
            .registry
            .register(RegistrationBuilder::new(&format!("w{i}")).build())
            .await
            .unwrap();
    }

    assert_eq!(backend.registry.len(), 3);
    assert_eq!(backend.telemetry.count(TelemetryEvent::WorkerRegistered), 3);
}

#[tokio::test]
async fn worker_claim_wins_over_stale_pending_record() {
    let backend = TestBackend::new();
    backend
        .store
        .create(
            OperationRecord::new("op-1")
                .distributed()
                .with_status(OperationStatus::Pending),
        )
        .await
        .unwrap();

    let outcome = backend
        .registry
        .register(RegistrationBuilder::new("w1").claiming("op-1").build())
        .await
        .unwrap();

    assert!(outcome.stop_operations.is_empty());
    assert_eq!(outcome.worker.status, WorkerStatus::Busy);

    let record = backend.store.get("op-1").await.unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Running);
    assert_eq!(record.claimed_worker(), Some("w1"));
}

#[tokio::test]
async fn terminal_record_overrides_worker_claim() {
    let backend = TestBackend::new();
    backend
        .store
        .create(
            OperationRecord::new("op-1")
                .distributed()
                .with_status(OperationStatus::Cancelled),
        )
        .await
        .unwrap();

    let outcome = backend
        .registry
        .register(RegistrationBuilder::new("w1").claiming("op-1").build())
        .await
        .unwrap();

    assert_eq!(outcome.stop_operations, vec!["op-1".to_string()]);
    assert_eq!(outcome.worker.status, WorkerStatus::Available);
    assert_eq!(backend.telemetry.count(TelemetryEvent::OperationStopped), 1);

    // The store keeps its terminal status.
    let record = backend.store.get("op-1").await.unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Cancelled);
}

#[tokio::test]
async fn retried_registration_applies_reports_once() {
    // A worker whose registration response was lost retries with the
    // same payload; the store must converge rather than flip-flop.
    let backend = TestBackend::new();
    backend.store.create(running_operation("op-1")).await.unwrap();

    let build = || {
        RegistrationBuilder::new("w1")
            .reporting(completed_report("op-1"))
            .build()
    };

    backend.registry.register(build()).await.unwrap();
    backend.registry.register(build()).await.unwrap();

    let record = backend.store.get("op-1").await.unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Completed);
    assert_eq!(record.result, Some(serde_json::json!({"ok": true})));
}

#[tokio::test]
async fn offline_completion_reaches_the_store_on_reconnect() {
    // The worker finished two operations while the backend was down;
    // one record survived the restart, one never existed.
    let backend = TestBackend::new();
    backend.store.create(running_operation("op-1")).await.unwrap();

    backend
        .registry
        .register(
            RegistrationBuilder::new("w1")
                .reporting(completed_report("op-1"))
                .reporting(
                    CompletedOperationReport::new("op-2", OperationStatus::Failed)
                        .with_error("feed gap in input data"),
                )
                .build(),
        )
        .await
        .unwrap();

    let op1 = backend.store.get("op-1").await.unwrap().unwrap();
    assert_eq!(op1.status, OperationStatus::Completed);

    let op2 = backend.store.get("op-2").await.unwrap().unwrap();
    assert_eq!(op2.status, OperationStatus::Failed);
    assert_eq!(op2.claimed_worker(), Some("w1"));
    assert_eq!(
        op2.error_message.as_deref(),
        Some("feed gap in input data")
    );
}

#[tokio::test]
async fn reregistration_replaces_stale_claim() {
    // First registration claims op-1; the worker then restarts and
    // comes back idle. The registry must not keep the stale claim.
    let backend = TestBackend::new();
    backend.store.create(running_operation("op-1")).await.unwrap();

    backend
        .registry
        .register(RegistrationBuilder::new("w1").claiming("op-1").build())
        .await
        .unwrap();
    assert_eq!(
        backend.registry.get("w1").unwrap().status,
        WorkerStatus::Busy
    );

    backend
        .registry
        .register(RegistrationBuilder::new("w1").build())
        .await
        .unwrap();

    let worker = backend.registry.get("w1").unwrap();
    assert_eq!(worker.status, WorkerStatus::Available);
    assert!(worker.current_operation_id.is_none());
    assert_eq!(
        backend.telemetry.count(TelemetryEvent::WorkerReRegistered),
        1
    );
}

#[tokio::test]
async fn capabilities_pass_through_unvalidated() {
    let backend = TestBackend::new();

    backend
        .registry
        .register(
            RegistrationBuilder::new("w1")
                .with_capability("cores", serde_json::json!(16))
                .with_capability("gpu", serde_json::json!({"model": "a100", "count": 2}))
                .build(),
        )
        .await
        .unwrap();

    let worker = backend.registry.get("w1").unwrap();
    assert_eq!(worker.capabilities.get("cores"), Some(&serde_json::json!(16)));
    assert_eq!(
        worker.capabilities["gpu"]["model"],
        serde_json::json!("a100")
    );
}
