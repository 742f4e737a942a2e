//! Storage backend on top of the Apache Arrow `object_store` crate.

use async_trait::async_trait;
use futures::StreamExt;
use object_store::path::Path as StoragePath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions};
use std::sync::Arc;
use tracing::debug;

use super::{ObjectInfo, Result, StorageBackend, StorageError};
use crate::source::{ByteStream, FileMetadata};

/// Backend wrapping any `object_store` implementation (S3, GCS, local, ...).
#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    pub bucket: String,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self { store, bucket }
    }

    /// In-memory backend for testing/development.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(object_store::memory::InMemory::new()),
            bucket: "loadvault-local".to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn store(&self, key: &str, mut stream: ByteStream, metadata: &FileMetadata) -> Result<()> {
        let path = StoragePath::from(key);

        // Drain the stream fully before the put so a mid-stream error never
        // leaves a committed object behind.
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
        }

        let mut attributes = Attributes::new();
        if !metadata.content_type.is_empty() {
            attributes.insert(
                Attribute::ContentType,
                metadata.content_type.clone().into(),
            );
        }

        let size = buf.len();
        self.store
            .put_opts(
                &path,
                buf.into(),
                PutOptions {
                    attributes,
                    ..Default::default()
                },
            )
            .await?;

        debug!(key, size, bucket = %self.bucket, "object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let path = StoragePath::from(key);
        let result = self.store.get(&path).await.map_err(map_not_found(key))?;
        let stream = result
            .into_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(Box::pin(stream))
    }

    async fn get_with_range(&self, key: &str, start: u64, end: u64) -> Result<ByteStream> {
        if end < start {
            return Err(StorageError::InvalidRange { start, end });
        }
        let path = StoragePath::from(key);
        let bytes = self
            .store
            .get_range(&path, start..end + 1)
            .await
            .map_err(map_not_found(key))?;
        Ok(Box::pin(futures::stream::once(async move {
            Ok::<_, std::io::Error>(bytes)
        })))
    }

    async fn get_info(&self, key: &str) -> Result<ObjectInfo> {
        let path = StoragePath::from(key);
        let meta = self.store.head(&path).await.map_err(map_not_found(key))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: meta.size,
            last_modified: meta.last_modified,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = StoragePath::from(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = StoragePath::from(key);
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            // Cleanup callers delete objects that may never have been written.
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn map_not_found(key: &str) -> impl FnOnce(object_store::Error) -> StorageError + '_ {
    move |e| match e {
        object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
        other => StorageError::ObjectStore(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::TryStreamExt;

    fn stream_of(chunks: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c))),
        ))
    }

    fn metadata() -> FileMetadata {
        FileMetadata {
            file_name: "a.bin".into(),
            file_size: 8,
            content_type: "application/octet-stream".into(),
            headers: Default::default(),
        }
    }

    async fn collect(stream: ByteStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn store_then_get() {
        let backend = ObjectStoreBackend::memory();
        backend
            .store("1/a.bin", stream_of(vec![b"abcd", b"efgh"]), &metadata())
            .await
            .unwrap();

        let body = collect(backend.get("1/a.bin").await.unwrap()).await;
        assert_eq!(body, b"abcdefgh");

        let info = backend.get_info("1/a.bin").await.unwrap();
        assert_eq!(info.size, 8);
        assert_eq!(info.key, "1/a.bin");
    }

    #[tokio::test]
    async fn ranged_get_is_inclusive() {
        let backend = ObjectStoreBackend::memory();
        backend
            .store("1/a.bin", stream_of(vec![b"abcdefgh"]), &metadata())
            .await
            .unwrap();

        let body = collect(backend.get_with_range("1/a.bin", 2, 5).await.unwrap()).await;
        assert_eq!(body, b"cdef");

        assert!(matches!(
            backend.get_with_range("1/a.bin", 5, 2).await,
            Err(StorageError::InvalidRange { .. })
        ));
    }

    #[tokio::test]
    async fn exists_and_delete() {
        let backend = ObjectStoreBackend::memory();
        assert!(!backend.exists("missing").await.unwrap());

        backend
            .store("1/a.bin", stream_of(vec![b"x"]), &metadata())
            .await
            .unwrap();
        assert!(backend.exists("1/a.bin").await.unwrap());

        backend.delete("1/a.bin").await.unwrap();
        assert!(!backend.exists("1/a.bin").await.unwrap());

        // Deleting an absent object is not an error.
        backend.delete("1/a.bin").await.unwrap();
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let backend = ObjectStoreBackend::memory();
        assert!(matches!(
            backend.get("nope").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            backend.get_info("nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failing_stream_leaves_no_object() {
        let backend = ObjectStoreBackend::memory();
        let broken: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("source died")),
        ]));

        let err = backend.store("1/a.bin", broken, &metadata()).await;
        assert!(matches!(err, Err(StorageError::Source(_))));
        assert!(!backend.exists("1/a.bin").await.unwrap());
    }
}
