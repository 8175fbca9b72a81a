//! Configuration for the worker agent.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Result, WorkerError};

/// Top-level worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Unique worker id. Defaults to the hostname with a random
    /// suffix so two workers on one host never collide.
    pub worker_id: String,
    /// The kind of work this worker executes, as the backend's wire
    /// string (e.g. `"backtesting"`).
    pub worker_type: String,
    /// Base URL of the coordination backend.
    pub backend_url: String,
    /// Address the worker's own HTTP server listens on.
    pub listen_addr: SocketAddr,
    /// URL the backend should use to reach this worker. Differs from
    /// `listen_addr` behind NAT or a container network.
    pub endpoint_url: String,
    /// Untyped capability bag advertised at registration.
    pub capabilities: Map<String, Value>,
    /// How long without a backend health check before the monitor
    /// assumes the backend forgot us.
    #[serde(with = "serde_duration_secs")]
    pub health_check_timeout: Duration,
    /// Interval between monitor checks.
    #[serde(with = "serde_duration_secs")]
    pub monitor_interval: Duration,
    /// Registration retry behaviour.
    pub registration: RegistrationConfig,
    /// Backend-shutdown reconnection behaviour.
    pub reconnect: ReconnectConfig,
    /// Upper bound on graceful-shutdown work before the process exits
    /// regardless.
    #[serde(with = "serde_duration_secs")]
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    /// Load configuration from the default sources.
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. `fleetd-worker.toml` in the current directory (if present)
    /// 3. Environment variables with `FLEETD_WORKER_` prefix
    pub fn load() -> Result<Self> {
        Figment::new()
            .merge(Toml::file("fleetd-worker.toml"))
            .merge(Env::prefixed("FLEETD_WORKER_").split("__"))
            .extract()
            .map_err(|e| WorkerError::Config(e.to_string()))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            worker_type: "backtesting".to_owned(),
            backend_url: "http://127.0.0.1:5002".to_owned(),
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5003),
            endpoint_url: "http://127.0.0.1:5003".to_owned(),
            capabilities: Map::new(),
            health_check_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(10),
            registration: RegistrationConfig::default(),
            reconnect: ReconnectConfig::default(),
            shutdown_timeout: Duration::from_secs(25),
        }
    }
}

/// Registration retry behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Maximum registration attempts per call.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    #[serde(with = "serde_duration_secs")]
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    #[serde(with = "serde_duration_secs")]
    pub max_backoff: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Reconnection polling after the backend announces shutdown.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Interval between reconnection attempts.
    #[serde(with = "serde_duration_secs")]
    pub poll_interval: Duration,
    /// Give up after this long; the monitor loop takes over.
    #[serde(with = "serde_duration_secs")]
    pub max_duration: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_duration: Duration::from_secs(300),
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_owned());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker_type, "backtesting");
        assert_eq!(config.health_check_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(25));
        assert_eq!(config.registration.max_retries, 5);
        assert!(!config.worker_id.is_empty());
    }

    #[test]
    fn worker_ids_are_unique_per_process() {
        assert_ne!(default_worker_id(), default_worker_id());
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            worker_id = "bt-worker-1"
            worker_type = "cpu_training"
            backend_url = "http://backend:5002"
            endpoint_url = "http://bt-worker-1:5003"
            health_check_timeout = 10

            [registration]
            max_retries = 2
            initial_backoff = 1

            [reconnect]
            poll_interval = 1
        "#;

        let config: WorkerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.worker_id, "bt-worker-1");
        assert_eq!(config.worker_type, "cpu_training");
        assert_eq!(config.health_check_timeout, Duration::from_secs(10));
        assert_eq!(config.registration.max_retries, 2);
        assert_eq!(config.reconnect.poll_interval, Duration::from_secs(1));
        // Untouched sections keep their defaults.
        assert_eq!(config.reconnect.max_duration, Duration::from_secs(300));
    }
}
