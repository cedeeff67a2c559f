use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{AmError, AmResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

/// Ambient application-master tunables. Defaults come from the embedded
/// TOML document; any value can be overridden through `CORRAL_*`
/// environment variables, e.g. `CORRAL_AM__MAX_CONTAINER_FAILURES=5`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub am: EngineConfig,
    pub master: MasterConfig,
    pub rpc: RpcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval of the resource-manager heartbeat.
    pub heartbeat_interval_millis: u64,
    /// Number of failed containers tolerated before the cluster is
    /// declared beyond saving.
    pub max_container_failures: usize,
    /// Priority attached to container requests.
    pub request_priority: i32,
    /// Pause after the completion signal so in-flight RPC replies
    /// can drain before the server stops.
    pub shutdown_drain_millis: u64,
    /// Per-task deadline when joining launcher tasks at shutdown.
    pub launcher_join_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Name of the backing-service binary under `<backingHome>/bin`.
    pub binary: String,
    /// Capacity of the child-output ring buffer, in lines.
    pub recent_output_lines: usize,
    /// Grace period between SIGTERM and SIGKILL when stopping the child.
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub listen_host: String,
    /// Bound on concurrent control RPC handlers.
    pub concurrency_limit: usize,
    pub retry_strategy: RetryStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed {
        max_count: usize,
        delay_secs: u64,
    },
    ExponentialBackoff {
        max_count: usize,
        initial_delay_secs: u64,
        max_delay_secs: u64,
        factor: u32,
    },
}

impl AppConfig {
    pub fn load() -> AmResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .merge(Env::prefixed("CORRAL_").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| AmError::BadConfig(e.to_string()))
    }
}

impl EngineConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_millis)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_millis)
    }

    pub fn launcher_join_timeout(&self) -> Duration {
        Duration::from_secs(self.launcher_join_timeout_secs)
    }
}

impl MasterConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl From<&RetryStrategy> for corral_server::RetryStrategy {
    fn from(config: &RetryStrategy) -> Self {
        match config {
            RetryStrategy::Fixed {
                max_count,
                delay_secs,
            } => Self::Fixed {
                max_count: *max_count,
                delay: Duration::from_secs(*delay_secs),
            },
            RetryStrategy::ExponentialBackoff {
                max_count,
                initial_delay_secs,
                max_delay_secs,
                factor,
            } => Self::ExponentialBackoff {
                max_count: *max_count,
                initial_delay: Duration::from_secs(*initial_delay_secs),
                max_delay: Duration::from_secs(*max_delay_secs),
                factor: *factor,
            },
        }
    }
}
