//! Common test utilities for backend integration tests.

pub mod fixtures;

use fleetd_backend::{
    api::{self, AppState},
    config::{DispatchConfig, OrphanConfig},
    DispatchService, OrphanDetector, WorkerRegistry,
};
use fleetd_core::{InMemoryOperationStore, RecordingTelemetry};
use std::sync::Arc;
use std::time::Duration;

/// Complete test backend setup with all components wired together.
pub struct TestBackend {
    pub registry: Arc<WorkerRegistry>,
    pub store: Arc<InMemoryOperationStore>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub orphan_detector: Arc<OrphanDetector>,
    pub dispatch: Arc<DispatchService>,
    pub app_state: Arc<AppState>,
}

impl TestBackend {
    /// Creates a new test backend with default configuration.
    pub fn new() -> Self {
        Self::with_config(OrphanConfig::default(), DispatchConfig::default())
    }

    /// Creates a new test backend with custom orphan and dispatch configuration.
    pub fn with_config(orphan_config: OrphanConfig, dispatch_config: DispatchConfig) -> Self {
        let store = Arc::new(InMemoryOperationStore::new());
        let telemetry = Arc::new(RecordingTelemetry::new());
        let registry = Arc::new(WorkerRegistry::new(store.clone(), telemetry.clone()));
        let orphan_detector = Arc::new(OrphanDetector::new(
            registry.clone(),
            store.clone(),
            telemetry.clone(),
            orphan_config,
        ));
        let dispatch = Arc::new(
            DispatchService::new(registry.clone(), store.clone(), dispatch_config)
                .expect("dispatch client"),
        );

        let app_state = Arc::new(AppState::new(
            registry.clone(),
            store.clone(),
            orphan_detector.clone(),
            dispatch.clone(),
        ));

        Self {
            registry,
            store,
            telemetry,
            orphan_detector,
            dispatch,
            app_state,
        }
    }

    /// Creates a test backend with millisecond-scale timers for
    /// time-sensitive tests.
    pub fn with_fast_timers() -> Self {
        Self::with_config(
            OrphanConfig {
                check_interval: Duration::from_millis(20),
                timeout: Duration::from_millis(50),
            },
            DispatchConfig {
                max_attempts: 3,
                request_timeout: Duration::from_millis(500),
            },
        )
    }

    /// Builds a router over the backend's state.
    pub fn router(&self) -> axum::Router {
        api::router(self.app_state.clone())
    }
}

impl Default for TestBackend {
    fn default() -> Self {
        Self::new()
    }
}
