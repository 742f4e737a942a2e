//! Source adapters: the byte producers the pipeline composes with storage.

pub mod http;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use crate::events::{AuthConfig, AuthKind};

/// The byte plane: a fallible stream of chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("{method} {url} returned status {status}")]
    UnexpectedStatus {
        method: &'static str,
        url: String,
        status: u16,
    },

    #[error("connection timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// Scheme of the submitted URL, as carried on `task.created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Http,
    Https,
    Ftp,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Http => write!(f, "http"),
            SourceType::Https => write!(f, "https"),
            SourceType::Ftp => write!(f, "ftp"),
        }
    }
}

/// Download tuning for a single task, with worker defaults already applied.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Hint for adapters that fetch in parallel; the HTTP adapter streams
    /// sequentially and ignores it.
    pub concurrency: u32,
    /// Bytes per second; zero disables the cap.
    pub max_speed: u64,
    pub max_retries: u32,
    /// Per-task wall clock.
    pub timeout: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_speed: 0,
            max_retries: 3,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// What the source reports about a file before streaming begins.
#[derive(Debug, Clone, Default)]
pub struct FileMetadata {
    pub file_name: String,
    /// -1 when the source does not report a size.
    pub file_size: i64,
    pub content_type: String,
    pub headers: HashMap<String, String>,
}

/// Capability set an adapter provides for one source type.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Open the byte stream. Returns the stream and the total size, or -1
    /// when unknown.
    async fn download(
        &self,
        url: &str,
        auth: Option<&AuthConfig>,
        opts: &DownloadOptions,
    ) -> Result<(ByteStream, i64)>;

    /// Probe source metadata without transferring the payload.
    async fn get_file_info(&self, url: &str, auth: Option<&AuthConfig>) -> Result<FileMetadata>;

    fn supports_resume(&self) -> bool;
}

/// Registry mapping source types to adapter instances.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: HashMap<SourceType, Arc<dyn Downloader>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with the built-in HTTP adapter serving both schemes.
    pub fn with_defaults(http: http::HttpConfig) -> Result<Self> {
        let mut registry = Self::new();
        let adapter = Arc::new(http::HttpDownloader::new(http)?);
        registry.register(SourceType::Http, adapter.clone());
        registry.register(SourceType::Https, adapter);
        Ok(registry)
    }

    pub fn register(&mut self, source_type: SourceType, adapter: Arc<dyn Downloader>) {
        self.adapters.insert(source_type, adapter);
    }

    pub fn get(&self, source_type: SourceType) -> Option<Arc<dyn Downloader>> {
        self.adapters.get(&source_type).cloned()
    }

    pub fn supports(&self, source_type: SourceType) -> bool {
        self.adapters.contains_key(&source_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_wire_format() {
        assert_eq!(serde_json::to_string(&SourceType::Https).unwrap(), "\"https\"");
        let back: SourceType = serde_json::from_str("\"ftp\"").unwrap();
        assert_eq!(back, SourceType::Ftp);
    }

    #[test]
    fn default_registry_covers_http_schemes() {
        let registry = SourceRegistry::with_defaults(http::HttpConfig::default()).unwrap();
        assert!(registry.supports(SourceType::Http));
        assert!(registry.supports(SourceType::Https));
        assert!(!registry.supports(SourceType::Ftp));
    }
}
