//! Operation dispatch to workers.
//!
//! Dispatch creates the durable operation record first, then tries
//! workers in least-recently-used order until one accepts. The record
//! starts pending reconciliation: the worker's own status callback is
//! what confirms the assignment landed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use fleetd_core::{
    OperationRecord, OperationStatus, OperationStore, OperationUpdate, ReconciliationStatus,
};

use crate::config::DispatchConfig;
use crate::error::{BackendError, Result};
use crate::registry::{WorkerRegistry, WorkerType};

/// The assignment payload POSTed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationAssignment {
    /// Backend-generated operation id.
    pub operation_id: String,
    /// Untyped operation parameters, passed through verbatim.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// A successful dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    /// The created operation.
    pub operation_id: String,
    /// The worker that accepted it.
    pub worker_id: String,
}

/// Places operations on available workers.
pub struct DispatchService {
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn OperationStore>,
    client: reqwest::Client,
    config: DispatchConfig,
}

impl DispatchService {
    /// Creates a dispatcher over the given registry and store.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn OperationStore>,
        config: DispatchConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(BackendError::Http)?;

        Ok(Self {
            registry,
            store,
            client,
            config,
        })
    }

    /// Creates an operation record and places it on a worker.
    ///
    /// A worker that refuses or fails the assignment call is excluded
    /// and the next least-recently-used one is tried, up to the
    /// configured attempt cap. The record is created before the first
    /// attempt so a crash mid-dispatch leaves a visible trace rather
    /// than a silently lost operation.
    pub async fn dispatch(
        &self,
        worker_type: WorkerType,
        parameters: Map<String, Value>,
    ) -> Result<DispatchReceipt> {
        let operation_id = Uuid::new_v4().to_string();

        let mut record = OperationRecord::new(&operation_id)
            .distributed()
            .with_reconciliation(ReconciliationStatus::PendingReconciliation);
        record.parameters = parameters.clone();
        self.store.create(record).await?;

        let assignment = OperationAssignment {
            operation_id: operation_id.clone(),
            parameters,
        };

        let mut tried = HashSet::new();
        while tried.len() < self.config.max_attempts {
            let Some(worker) = self.registry.select_excluding(worker_type, &tried) else {
                break;
            };

            match self.assign(&worker.endpoint_url, &assignment).await {
                Ok(()) => {
                    self.registry.mark_busy(&worker.worker_id, &operation_id);
                    self.store
                        .update(
                            &operation_id,
                            OperationUpdate::new()
                                .status(OperationStatus::Running)
                                .worker(&worker.worker_id),
                        )
                        .await?;
                    info!(
                        operation_id = %operation_id,
                        worker_id = %worker.worker_id,
                        "operation dispatched"
                    );
                    return Ok(DispatchReceipt {
                        operation_id,
                        worker_id: worker.worker_id,
                    });
                }
                Err(e) => {
                    warn!(
                        operation_id = %operation_id,
                        worker_id = %worker.worker_id,
                        error = %e,
                        "worker refused assignment, trying next"
                    );
                    tried.insert(worker.worker_id);
                }
            }
        }

        if tried.is_empty() {
            let (registered, available) = self.registry.capacity_counts(worker_type);
            self.store
                .update(
                    &operation_id,
                    OperationUpdate::new()
                        .status(OperationStatus::Failed)
                        .error("no workers available"),
                )
                .await?;
            return Err(BackendError::NoWorkersAvailable {
                worker_type,
                registered,
                available,
            });
        }

        self.store
            .update(
                &operation_id,
                OperationUpdate::new()
                    .status(OperationStatus::Failed)
                    .error(format!("dispatch failed after {} attempts", tried.len())),
            )
            .await?;
        Err(BackendError::DispatchFailed {
            operation_id,
            attempts: tried.len(),
        })
    }

    async fn assign(&self, endpoint_url: &str, assignment: &OperationAssignment) -> Result<()> {
        let url = format!("{}/backtests/start", endpoint_url.trim_end_matches('/'));
        self.client
            .post(&url)
            .json(assignment)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl std::fmt::Debug for DispatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::{RegisterRequest, WorkerStatus};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use fleetd_core::{InMemoryOperationStore, NoopTelemetry};
    use std::time::Duration;

    fn test_config() -> DispatchConfig {
        DispatchConfig {
            max_attempts: 3,
            request_timeout: Duration::from_millis(500),
        }
    }

    fn make_registry() -> (Arc<WorkerRegistry>, Arc<InMemoryOperationStore>) {
        let store = Arc::new(InMemoryOperationStore::new());
        let registry = Arc::new(WorkerRegistry::new(store.clone(), Arc::new(NoopTelemetry)));
        (registry, store)
    }

    async fn register(registry: &WorkerRegistry, id: &str, endpoint: &str) {
        registry
            .register(RegisterRequest {
                worker_id: id.to_owned(),
                worker_type: WorkerType::Backtesting,
                endpoint_url: endpoint.to_owned(),
                capabilities: Map::new(),
                current_operation_id: None,
                completed_operations: Vec::new(),
            })
            .await
            .unwrap();
    }

    async fn stub_worker(accept: bool) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/backtests/start",
            post(move || async move {
                if accept {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn dispatch_places_operation_and_marks_worker_busy() {
        let (registry, store) = make_registry();
        let endpoint = stub_worker(true).await;
        register(&registry, "w1", &endpoint).await;

        let service = DispatchService::new(registry.clone(), store.clone(), test_config()).unwrap();
        let mut parameters = Map::new();
        parameters.insert("strategy".to_owned(), Value::String("momentum".to_owned()));

        let receipt = service
            .dispatch(WorkerType::Backtesting, parameters)
            .await
            .unwrap();
        assert_eq!(receipt.worker_id, "w1");

        let worker = registry.get("w1").unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);
        assert_eq!(
            worker.current_operation_id.as_deref(),
            Some(receipt.operation_id.as_str())
        );

        let record = store.get(&receipt.operation_id).await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Running);
        assert_eq!(record.claimed_worker(), Some("w1"));
        assert_eq!(
            record.reconciliation_status,
            ReconciliationStatus::PendingReconciliation
        );
        assert_eq!(
            record.parameters.get("strategy"),
            Some(&Value::String("momentum".to_owned()))
        );
    }

    #[tokio::test]
    async fn no_workers_yields_capacity_diagnostics() {
        let (registry, store) = make_registry();
        let endpoint = stub_worker(true).await;
        register(&registry, "w1", &endpoint).await;
        registry.mark_busy("w1", "op-other");

        let service = DispatchService::new(registry, store, test_config()).unwrap();
        let err = service
            .dispatch(WorkerType::Backtesting, Map::new())
            .await
            .unwrap_err();

        match err {
            BackendError::NoWorkersAvailable {
                registered,
                available,
                ..
            } => {
                assert_eq!(registered, 1);
                assert_eq!(available, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn refusing_worker_is_excluded_and_next_tried() {
        let (registry, store) = make_registry();
        let refusing = stub_worker(false).await;
        let accepting = stub_worker(true).await;
        register(&registry, "w-refuse", &refusing).await;
        register(&registry, "w-accept", &accepting).await;

        let service = DispatchService::new(registry.clone(), store, test_config()).unwrap();

        // Both orderings reach the accepting worker within two attempts.
        let receipt = service
            .dispatch(WorkerType::Backtesting, Map::new())
            .await
            .unwrap();
        assert_eq!(receipt.worker_id, "w-accept");
        assert_eq!(
            registry.get("w-refuse").unwrap().status,
            WorkerStatus::Available
        );
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_the_record() {
        let (registry, store) = make_registry();
        let refusing = stub_worker(false).await;
        register(&registry, "w1", &refusing).await;

        let service = DispatchService::new(registry, store.clone(), test_config()).unwrap();
        let err = service
            .dispatch(WorkerType::Backtesting, Map::new())
            .await
            .unwrap_err();

        let BackendError::DispatchFailed {
            operation_id,
            attempts,
        } = err
        else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(attempts, 1);

        let record = store.get(&operation_id).await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Failed);
        assert!(record.error_message.unwrap().contains("dispatch failed"));
    }
}
