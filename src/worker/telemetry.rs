//! Telemetry facade over the event bus.
//!
//! Marshals worker events to JSON, attaches `eventType`/`taskID` metadata,
//! and publishes to the fixed topics. No retry on bus failure: errors
//! surface to the caller, which routes them through the pipeline's error
//! handler.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use super::Progress;
use crate::bus::{Message, Publisher};
use crate::errors::TaskError;
use crate::events::{
    TaskCompletedEvent, TaskFailedEvent, TaskProgressUpdatedEvent, TaskStatus,
    TaskStatusUpdatedEvent, TOPIC_PROGRESS_UPDATED, TOPIC_STATUS_UPDATED, TOPIC_TASK_COMPLETED,
    TOPIC_TASK_FAILED,
};

pub struct TelemetryPublisher {
    publisher: Arc<dyn Publisher>,
}

impl TelemetryPublisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    pub async fn publish_status_updated(
        &self,
        task_id: u64,
        status: TaskStatus,
    ) -> Result<(), TaskError> {
        let event = TaskStatusUpdatedEvent {
            task_id,
            status,
            updated_at: Utc::now(),
        };
        self.publish(TOPIC_STATUS_UPDATED, "TaskStatusUpdated", task_id, &event)
            .await
    }

    pub async fn publish_progress_updated(
        &self,
        task_id: u64,
        progress: &Progress,
    ) -> Result<(), TaskError> {
        let event = TaskProgressUpdatedEvent {
            task_id,
            progress: progress.percentage,
            downloaded_bytes: progress.downloaded_bytes,
            total_bytes: progress.total_bytes,
            updated_at: progress.updated_at,
        };
        self.publish(TOPIC_PROGRESS_UPDATED, "TaskProgressUpdated", task_id, &event)
            .await
    }

    pub async fn publish_completed(&self, event: TaskCompletedEvent) -> Result<(), TaskError> {
        self.publish(TOPIC_TASK_COMPLETED, "TaskCompleted", event.task_id, &event)
            .await
    }

    pub async fn publish_failed(&self, task_id: u64, error: &str) -> Result<(), TaskError> {
        let event = TaskFailedEvent {
            task_id,
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        self.publish(TOPIC_TASK_FAILED, "TaskFailed", task_id, &event)
            .await
    }

    async fn publish<E: Serialize>(
        &self,
        topic: &str,
        event_type: &str,
        task_id: u64,
        event: &E,
    ) -> Result<(), TaskError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| TaskError::internal("failed to encode event", e))?;
        let message = Message::new(payload)
            .with_metadata("eventType", event_type)
            .with_metadata("taskID", task_id.to_string());
        self.publisher
            .publish(topic, message)
            .await
            .map_err(|e| TaskError::internal(format!("failed to publish to {topic}"), e))
    }
}

/// Cheap handle the per-chunk progress callback uses to hand snapshots to the
/// forwarder task. The throttle has already run by the time a snapshot is
/// sent, so the channel carries at most one message per task per second.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<(u64, Progress)>,
}

impl ProgressSender {
    pub fn send(&self, task_id: u64, progress: Progress) {
        if self.tx.send((task_id, progress)).is_err() {
            warn!(task_id, "progress forwarder gone, dropping update");
        }
    }
}

/// Spawn the forwarder that drains throttled progress snapshots onto the bus.
pub fn spawn_progress_forwarder(telemetry: Arc<TelemetryPublisher>) -> ProgressSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<(u64, Progress)>();
    tokio::spawn(async move {
        while let Some((task_id, progress)) = rx.recv().await {
            if let Err(e) = telemetry.publish_progress_updated(task_id, &progress).await {
                warn!(task_id, error = %e, "failed to publish progress event");
            }
        }
    });
    ProgressSender { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBus;
    use crate::bus::Subscriber;
    use crate::events::TOPIC_STATUS_UPDATED;

    #[tokio::test]
    async fn status_event_carries_metadata_and_payload() {
        let bus = Arc::new(InMemoryBus::new());
        let mut sub = bus.subscribe(TOPIC_STATUS_UPDATED).await.unwrap();
        let telemetry = TelemetryPublisher::new(bus.clone());

        telemetry
            .publish_status_updated(12, TaskStatus::Downloading)
            .await
            .unwrap();

        let delivery = sub.recv().await.unwrap();
        assert_eq!(
            delivery.message.metadata.get("eventType").map(String::as_str),
            Some("TaskStatusUpdated")
        );
        assert_eq!(
            delivery.message.metadata.get("taskID").map(String::as_str),
            Some("12")
        );

        let event: TaskStatusUpdatedEvent =
            serde_json::from_slice(&delivery.message.payload).unwrap();
        assert_eq!(event.task_id, 12);
        assert_eq!(event.status, TaskStatus::Downloading);
        delivery.ack();
    }

    #[tokio::test]
    async fn forwarder_publishes_snapshots() {
        let bus = Arc::new(InMemoryBus::new());
        let mut sub = bus.subscribe(crate::events::TOPIC_PROGRESS_UPDATED).await.unwrap();
        let telemetry = Arc::new(TelemetryPublisher::new(bus.clone()));
        let sender = spawn_progress_forwarder(telemetry);

        sender.send(
            3,
            Progress {
                downloaded_bytes: 512,
                total_bytes: 1024,
                percentage: 50.0,
                updated_at: Utc::now(),
            },
        );

        let delivery = sub.recv().await.unwrap();
        let event: TaskProgressUpdatedEvent =
            serde_json::from_slice(&delivery.message.payload).unwrap();
        assert_eq!(event.task_id, 3);
        assert_eq!(event.downloaded_bytes, 512);
        assert_eq!(event.total_bytes, 1024);
        delivery.ack();
    }
}
