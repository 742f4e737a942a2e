//! Per-task execution pipeline: announce, probe, open with retry, compose
//! transforms, store, complete or fail.

use md5::{Digest, Md5};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::dispatcher::TaskExecution;
use super::stream::{HashingStream, PausableProgressStream, ProgressFn};
use super::telemetry::{ProgressSender, TelemetryPublisher};
use super::throttle::ProgressThrottle;
use super::ErrorHandler;
use crate::errors::TaskError;
use crate::events::{ChecksumInfo, TaskCompletedEvent, TaskStatus};
use crate::source::Downloader;
use crate::storage::StorageBackend;

/// Independent deadline for the best-effort partial-object delete.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Pipeline {
    storage: Arc<dyn StorageBackend>,
    telemetry: Arc<TelemetryPublisher>,
    throttle: Arc<ProgressThrottle>,
    progress: ProgressSender,
    error_handler: ErrorHandler,
    retry_backoff_cap: Duration,
}

impl Pipeline {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        telemetry: Arc<TelemetryPublisher>,
        throttle: Arc<ProgressThrottle>,
        progress: ProgressSender,
        error_handler: ErrorHandler,
        retry_backoff_cap: Duration,
    ) -> Self {
        Self {
            storage,
            telemetry,
            throttle,
            progress,
            error_handler,
            retry_backoff_cap,
        }
    }

    /// Drive one admitted task from downloading to completed/failed.
    pub(super) async fn run(
        &self,
        execution: &Arc<TaskExecution>,
        adapter: Arc<dyn Downloader>,
    ) -> Result<(), TaskError> {
        let request = execution.request();
        let task_id = request.task_id;
        let cancel = execution.cancel_token();

        self.telemetry
            .publish_status_updated(task_id, TaskStatus::Downloading)
            .await?;

        // Probe source metadata before any bytes move.
        let metadata = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(self.fail(task_id, TaskError::internal_msg("task cancelled")).await);
            }
            probed = adapter.get_file_info(&request.source_url, request.source_auth.as_ref()) => {
                match probed {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        return Err(self
                            .fail(task_id, TaskError::internal("failed to get file info", e))
                            .await);
                    }
                }
            }
        };

        // Open the stream, retrying the open only. Once bytes flow, transport
        // failure is terminal for the attempt: re-opening mid-stream would
        // double-bill the source and double-store bytes.
        let mut attempt: u32 = 0;
        let (source_stream, total_size) = loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(self.fail(task_id, TaskError::internal_msg("task cancelled")).await);
                }
                opened = adapter.download(&request.source_url, request.source_auth.as_ref(), &request.options) => opened,
            };

            match opened {
                Ok(opened) => break opened,
                Err(e) => {
                    if attempt >= request.options.max_retries {
                        return Err(self
                            .fail(
                                task_id,
                                TaskError::internal(
                                    format!(
                                        "failed to start download after {} attempts",
                                        attempt + 1
                                    ),
                                    e,
                                ),
                            )
                            .await);
                    }
                    let backoff = retry_backoff(attempt, self.retry_backoff_cap);
                    warn!(
                        task_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "source open failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(self
                                .fail(task_id, TaskError::internal_msg("task cancelled"))
                                .await);
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        };

        execution.set_total_bytes(total_size);
        if self.throttle.should_emit(task_id) {
            if let Err(e) = self
                .telemetry
                .publish_progress_updated(task_id, &execution.progress())
                .await
            {
                (self.error_handler)(&e);
            }
        }

        // Compose pause gate -> progress meter -> hash tee, and expose the
        // gate so pause/resume can reach this execution.
        let on_progress: ProgressFn = {
            let execution = execution.clone();
            let throttle = self.throttle.clone();
            let sender = self.progress.clone();
            Box::new(move |downloaded| {
                let snapshot = execution.update_progress(downloaded);
                if throttle.should_emit(execution.request().task_id) {
                    sender.send(execution.request().task_id, snapshot);
                }
            })
        };
        let progress_stream =
            PausableProgressStream::new(source_stream, cancel.clone(), on_progress);
        execution.attach_gate(progress_stream.gate());
        let (hashing_stream, digest) = HashingStream::new(progress_stream);

        if let Err(e) = self
            .telemetry
            .publish_status_updated(task_id, TaskStatus::Storing)
            .await
        {
            (self.error_handler)(&e);
        }

        let file_name = if request.file_name.is_empty() {
            metadata.file_name.clone()
        } else {
            request.file_name.clone()
        };
        let key = storage_key(task_id, &request.source_url, &file_name);
        execution.set_storage_key(key.clone());

        debug!(task_id, key, total_size, "storing payload");

        if let Err(e) = self
            .storage
            .store(&key, Box::pin(hashing_stream), &metadata)
            .await
        {
            self.cleanup_partial(task_id, &key).await;
            return Err(self
                .fail(task_id, TaskError::internal("failed to store file", e))
                .await);
        }

        let checksum = digest.finalize_hex();
        let final_progress = execution.complete_progress();
        let file_size = if total_size >= 0 {
            total_size
        } else {
            final_progress.downloaded_bytes as i64
        };

        let completed = TaskCompletedEvent {
            task_id,
            file_name,
            file_size,
            content_type: metadata.content_type.clone(),
            checksum: ChecksumInfo {
                checksum_type: "md5".into(),
                checksum_value: checksum,
            },
            storage_key: key,
            completed_at: chrono::Utc::now(),
        };
        if let Err(e) = self.telemetry.publish_completed(completed).await {
            return Err(self.fail(task_id, e).await);
        }

        // Terminal 100% progress event; bypasses the throttle.
        if let Err(e) = self
            .telemetry
            .publish_progress_updated(task_id, &final_progress)
            .await
        {
            (self.error_handler)(&e);
        }

        info!(task_id, "task completed");
        Ok(())
    }

    /// Failure path for an execution whose pipeline future was already torn
    /// down (timeout): publish the failure and clean up anything stored.
    pub(super) async fn abort(&self, execution: &Arc<TaskExecution>, reason: &str) -> TaskError {
        let task_id = execution.request().task_id;
        if let Some(key) = execution.storage_key() {
            self.cleanup_partial(task_id, &key).await;
        }
        self.fail(task_id, TaskError::internal_msg(reason)).await
    }

    /// Central mark-failed routine: publishes `task.failed` and hands the
    /// error back to the dispatcher. The publish is not tied to the task's
    /// token, so cancellation or expiry cannot suppress the event.
    async fn fail(&self, task_id: u64, error: TaskError) -> TaskError {
        warn!(task_id, error = %error, code = error.code(), "task failed");
        if let Err(publish_err) = self.telemetry.publish_failed(task_id, &error.to_string()).await
        {
            (self.error_handler)(&publish_err);
        }
        error
    }

    /// Best-effort delete of a possibly partial object. Runs under its own
    /// deadline: the task context may already be cancelled and must not be
    /// able to starve the cleanup.
    async fn cleanup_partial(&self, task_id: u64, key: &str) {
        match tokio::time::timeout(CLEANUP_TIMEOUT, self.storage.delete(key)).await {
            Ok(Ok(())) => debug!(task_id, key, "partial object cleaned up"),
            Ok(Err(e)) => (self.error_handler)(&TaskError::internal(
                format!("failed to clean up partial object {key}"),
                e,
            )),
            Err(_) => (self.error_handler)(&TaskError::internal_msg(format!(
                "timed out cleaning up partial object {key}"
            ))),
        }
    }
}

/// Exponential back-off for stream-open retries:
/// `min(2^attempt seconds, cap)` plus up to one second of jitter.
fn retry_backoff(attempt: u32, cap: Duration) -> Duration {
    let base = Duration::from_secs(1u64 << attempt.min(16));
    base.min(cap) + Duration::from_secs_f64(rand::random::<f64>())
}

/// Deterministic storage key: `<task_id>/<name>-<md5(url)[..8]>` with `/`
/// replaced in the name. A re-executed task lands on the same key, which is
/// what makes completion idempotent across workers.
pub fn storage_key(task_id: u64, source_url: &str, file_name: &str) -> String {
    let sanitized = file_name.replace('/', "_");
    let url_digest = format!("{:x}", Md5::digest(source_url.as_bytes()));
    format!("{}/{}-{}", task_id, sanitized, &url_digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_is_deterministic() {
        let a = storage_key(42, "https://example.com/file.bin", "file.bin");
        let b = storage_key(42, "https://example.com/file.bin", "file.bin");
        assert_eq!(a, b);
        assert!(a.starts_with("42/file.bin-"));

        // Eight hex characters of the url digest.
        let suffix = a.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn storage_key_varies_with_inputs() {
        let base = storage_key(1, "https://example.com/a", "a");
        assert_ne!(base, storage_key(2, "https://example.com/a", "a"));
        assert_ne!(base, storage_key(1, "https://example.com/b", "a"));
        assert_ne!(base, storage_key(1, "https://example.com/a", "b"));
    }

    #[test]
    fn storage_key_sanitizes_separators() {
        let key = storage_key(7, "https://example.com/x", "dir/sub/name.bin");
        assert!(key.starts_with("7/dir_sub_name.bin-"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cap = Duration::from_secs(4);
        for attempt in 0..8 {
            let backoff = retry_backoff(attempt, cap);
            let floor = Duration::from_secs(1u64 << attempt.min(16)).min(cap);
            assert!(backoff >= floor);
            assert!(backoff < floor + Duration::from_secs(1));
        }
    }
}
