use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::source::http::HttpConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpClientConfig,
}

/// Operational HTTP surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Dispatcher and pipeline tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Upper bound on simultaneously executing pipelines.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Minimum spacing of progress events per task.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Cap on the exponential open-retry back-off.
    #[serde(default = "default_retry_backoff_cap_secs")]
    pub retry_backoff_cap_secs: u64,
    /// How long shutdown waits for in-flight pipelines to unwind.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn retry_backoff_cap(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_cap_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            progress_interval_ms: default_progress_interval_ms(),
            retry_backoff_cap_secs: default_retry_backoff_cap_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Event bus behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Redelivery delay after a negative acknowledgement.
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
}

impl BusConfig {
    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.redelivery_backoff_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
        }
    }
}

/// Storage provider type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Memory,
    Local,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Root directory for the local provider.
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            bucket: default_bucket(),
            path: None,
        }
    }
}

/// Outgoing HTTP client used by the source adapter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpClientConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl HttpClientConfig {
    pub fn to_client_config(&self) -> HttpConfig {
        HttpConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8091".parse().unwrap()
}

fn default_max_concurrent() -> usize {
    crate::worker::dispatcher::DEFAULT_MAX_CONCURRENT
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_retry_backoff_cap_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_redelivery_backoff_ms() -> u64 {
    100
}

fn default_bucket() -> String {
    "loadvault".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("loadvault/", env!("CARGO_PKG_VERSION")).to_string()
}
