//! Configuration for the backend.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{BackendError, Result};

/// Top-level backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// HTTP API configuration.
    pub api: ApiConfig,
    /// Worker health-check configuration.
    pub health: HealthConfig,
    /// Orphan-detector configuration.
    pub orphan: OrphanConfig,
    /// Dispatch configuration.
    pub dispatch: DispatchConfig,
}

impl BackendConfig {
    /// Load configuration from the default sources.
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. `fleetd.toml` in the current directory (if present)
    /// 3. Environment variables with `FLEETD_BACKEND_` prefix
    pub fn load() -> Result<Self> {
        Figment::new()
            .merge(Toml::file("fleetd.toml"))
            .merge(Env::prefixed("FLEETD_BACKEND_").split("__"))
            .extract()
            .map_err(|e| BackendError::Config(e.to_string()))
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5002),
        }
    }
}

/// Worker health-check configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between probe sweeps.
    #[serde(with = "serde_duration_secs")]
    pub probe_interval: Duration,
    /// Per-probe timeout; a slow worker never delays the others.
    #[serde(with = "serde_duration_secs")]
    pub probe_timeout: Duration,
    /// Consecutive failures before a worker is marked temporarily unavailable.
    pub failure_threshold: u32,
    /// How long a worker may stay unhealthy before full removal.
    #[serde(with = "serde_duration_secs")]
    pub removal_grace: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            removal_grace: Duration::from_secs(120),
        }
    }
}

/// Orphan-detector configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    /// Interval between detector sweeps.
    #[serde(with = "serde_duration_secs")]
    pub check_interval: Duration,
    /// How long an operation may stay unclaimed before it is failed.
    #[serde(with = "serde_duration_secs")]
    pub timeout: Duration,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum distinct workers tried per dispatch.
    pub max_attempts: usize,
    /// Timeout for the dispatch request to a worker.
    #[serde(with = "serde_duration_secs")]
    pub request_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            request_timeout: Duration::from_secs(10),
        }
    }
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
