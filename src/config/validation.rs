use thiserror::Error;

use super::models::{Config, StorageProvider};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("worker.max_concurrent must be at least 1")]
    ZeroConcurrency,

    #[error("worker.progress_interval_ms must be at least 1")]
    ZeroProgressInterval,

    #[error("storage.path is required when storage.provider is \"local\"")]
    MissingLocalStoragePath,
}

pub(super) fn validate(config: &Config) -> Result<(), ValidationError> {
    if config.worker.max_concurrent == 0 {
        return Err(ValidationError::ZeroConcurrency);
    }
    if config.worker.progress_interval_ms == 0 {
        return Err(ValidationError::ZeroProgressInterval);
    }
    if config.storage.provider == StorageProvider::Local && config.storage.path.is_none() {
        return Err(ValidationError::MissingLocalStoragePath);
    }
    Ok(())
}
