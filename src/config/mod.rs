//! Layered configuration: embedded defaults, an optional TOML file, then
//! environment variables (highest priority).
//!
//! The file defaults to `config/loadvault.toml` and can be pointed elsewhere
//! with the `--config` flag. Environment overrides use the pattern
//! `LOADVAULT__<SECTION>__<KEY>`, e.g. `LOADVAULT__WORKER__MAX_CONCURRENT=8`.

mod models;
mod sources;
mod validation;

pub use models::{
    BusConfig, Config, HttpClientConfig, ServerConfig, StorageConfig, StorageProvider,
    WorkerConfig,
};
pub use validation::ValidationError;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl Config {
    /// Load from the default location (missing file is fine) plus env.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load from an explicit path plus env. The file must exist.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let config = sources::load_from_path(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_apply_with_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("empty.toml");
        fs::write(&config_path, "").unwrap();

        let config = Config::load_from_path(&config_path).unwrap();
        assert_eq!(config.worker.max_concurrent, 5);
        assert_eq!(config.worker.progress_interval_ms, 1000);
        assert_eq!(config.bus.redelivery_backoff_ms, 100);
        assert_eq!(config.storage.provider, StorageProvider::Memory);
    }

    #[test]
    fn file_values_override_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("worker.toml");

        let toml_content = r#"
[server]
bind_addr = "127.0.0.1:9000"

[worker]
max_concurrent = 2
progress_interval_ms = 250

[storage]
provider = "local"
bucket = "payloads"
path = "data/objects"

[http]
user_agent = "downloader/1.0"
        "#;
        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(&config_path).unwrap();
        assert_eq!(config.server.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.worker.max_concurrent, 2);
        assert_eq!(
            config.worker.progress_interval(),
            std::time::Duration::from_millis(250)
        );
        assert_eq!(config.storage.provider, StorageProvider::Local);
        assert_eq!(config.storage.bucket, "payloads");
        assert_eq!(config.http.user_agent, "downloader/1.0");
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bad.toml");
        fs::write(&config_path, "[worker]\nmax_concurrent = 0\n").unwrap();

        let result = Config::load_from_path(&config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::Validation(ValidationError::ZeroConcurrency)
        ));
    }

    #[test]
    fn validation_rejects_local_provider_without_path() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bad.toml");
        fs::write(&config_path, "[storage]\nprovider = \"local\"\n").unwrap();

        let result = Config::load_from_path(&config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::Validation(ValidationError::MissingLocalStoragePath)
        ));
    }
}
