//! Object storage abstraction for downloaded payloads.
//!
//! [`StorageBackend`] is the contract the pipeline drives: `store` must drain
//! the byte stream end-to-end before returning. On a failed or interrupted
//! store the object may exist in a partial state; the worker cleans up with
//! `delete`, so `delete` treats a missing object as success.

pub mod object;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::source::{ByteStream, FileMetadata};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid range {start}..={end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("source stream failed: {0}")]
    Source(#[from] std::io::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Metadata of a stored object, as reported by the backend.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Drain `stream` into the object at `key`. The object may be left
    /// partial if the stream errors mid-way.
    async fn store(&self, key: &str, stream: ByteStream, metadata: &FileMetadata) -> Result<()>;

    async fn get(&self, key: &str) -> Result<ByteStream>;

    /// Inclusive byte range, HTTP-style.
    async fn get_with_range(&self, key: &str, start: u64, end: u64) -> Result<ByteStream>;

    async fn get_info(&self, key: &str) -> Result<ObjectInfo>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}
