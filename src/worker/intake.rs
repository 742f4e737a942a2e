//! Event intake: subscribes to the control topics and feeds the dispatcher.
//!
//! Malformed payloads are nacked for redelivery; command failures
//! (unknown task, not yet pausable, ...) are logged and acked, since
//! redelivering them cannot change the outcome.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use super::TaskRequest;
use crate::bus::{Subscriber, Subscription};
use crate::errors::TaskError;
use crate::events::{
    TaskCancelledEvent, TaskCreatedEvent, TaskPausedEvent, TaskResumedEvent, TOPIC_TASK_CANCELLED,
    TOPIC_TASK_CREATED, TOPIC_TASK_PAUSED, TOPIC_TASK_RESUMED,
};
use crate::source::DownloadOptions;

pub struct EventIntake {
    subscriber: Arc<dyn Subscriber>,
    dispatcher: Arc<Dispatcher>,
}

#[derive(Clone, Copy)]
enum ControlOp {
    Pause,
    Resume,
    Cancel,
}

impl ControlOp {
    fn name(self) -> &'static str {
        match self {
            ControlOp::Pause => "pause",
            ControlOp::Resume => "resume",
            ControlOp::Cancel => "cancel",
        }
    }
}

impl EventIntake {
    pub fn new(subscriber: Arc<dyn Subscriber>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            subscriber,
            dispatcher,
        }
    }

    /// Subscribe to every control topic and spawn one consumer loop each.
    /// The loops stop accepting once `shutdown` fires.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>, TaskError> {
        let created = self.subscribe(TOPIC_TASK_CREATED).await?;
        let paused = self.subscribe(TOPIC_TASK_PAUSED).await?;
        let resumed = self.subscribe(TOPIC_TASK_RESUMED).await?;
        let cancelled = self.subscribe(TOPIC_TASK_CANCELLED).await?;

        Ok(vec![
            tokio::spawn(consume_created(
                created,
                self.dispatcher.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(consume_control(
                paused,
                self.dispatcher.clone(),
                shutdown.clone(),
                ControlOp::Pause,
            )),
            tokio::spawn(consume_control(
                resumed,
                self.dispatcher.clone(),
                shutdown.clone(),
                ControlOp::Resume,
            )),
            tokio::spawn(consume_control(
                cancelled,
                self.dispatcher.clone(),
                shutdown,
                ControlOp::Cancel,
            )),
        ])
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TaskError> {
        self.subscriber
            .subscribe(topic)
            .await
            .map_err(|e| TaskError::internal(format!("failed to subscribe to {topic}"), e))
    }
}

async fn consume_created(
    mut sub: Subscription,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            delivery = sub.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let event: TaskCreatedEvent = match serde_json::from_slice(&delivery.message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "malformed task.created payload");
                delivery.nack();
                continue;
            }
        };
        delivery.ack();

        // ExecuteTask blocks until the pipeline terminates, so each admitted
        // task gets its own task. The shutdown token doubles as the caller
        // context bounding the admission wait.
        let request = request_from_event(event);
        let task_id = request.task_id;
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.execute_task(&shutdown, request).await {
                warn!(task_id, code = e.code(), error = %e, "task execution failed");
            }
        });
    }
    info!("task.created intake stopped");
}

async fn consume_control(
    mut sub: Subscription,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    op: ControlOp,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            delivery = sub.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let decoded = match op {
            ControlOp::Pause => {
                serde_json::from_slice::<TaskPausedEvent>(&delivery.message.payload)
                    .map(|e| e.task_id)
            }
            ControlOp::Resume => {
                serde_json::from_slice::<TaskResumedEvent>(&delivery.message.payload)
                    .map(|e| e.task_id)
            }
            ControlOp::Cancel => {
                serde_json::from_slice::<TaskCancelledEvent>(&delivery.message.payload)
                    .map(|e| e.task_id)
            }
        };

        let task_id = match decoded {
            Ok(task_id) => task_id,
            Err(e) => {
                warn!(op = op.name(), error = %e, "malformed control payload");
                delivery.nack();
                continue;
            }
        };
        delivery.ack();

        let result = match op {
            ControlOp::Pause => dispatcher.pause_task(task_id).await,
            ControlOp::Resume => dispatcher.resume_task(task_id).await,
            ControlOp::Cancel => dispatcher.cancel_task(task_id).await,
        };
        if let Err(e) = result {
            warn!(task_id, op = op.name(), code = e.code(), error = %e, "control command failed");
        }
    }
    info!(op = op.name(), "control intake stopped");
}

/// Map a wire event to an admitted work order, applying worker defaults to
/// absent options.
pub(crate) fn request_from_event(event: TaskCreatedEvent) -> TaskRequest {
    let defaults = DownloadOptions::default();
    let wire = event.download_options.unwrap_or_default();

    let options = DownloadOptions {
        concurrency: wire.concurrency.filter(|c| *c > 0).unwrap_or(defaults.concurrency),
        max_speed: wire.max_speed.unwrap_or(defaults.max_speed),
        max_retries: wire.max_retries.unwrap_or(defaults.max_retries),
        timeout: wire
            .timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
    };

    TaskRequest {
        task_id: event.task_id,
        of_account_id: event.of_account_id,
        file_name: event.file_name,
        source_url: event.source_url,
        source_type: event.source_type,
        source_auth: event.source_auth,
        options,
        metadata: event.metadata,
        checksum: event.checksum,
        created_at: event.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DownloadOptions as WireOptions;
    use crate::source::SourceType;

    fn created(options: Option<WireOptions>) -> TaskCreatedEvent {
        TaskCreatedEvent {
            task_id: 1,
            of_account_id: 2,
            file_name: String::new(),
            source_url: "https://example.com/f.bin".into(),
            source_type: SourceType::Https,
            source_auth: None,
            download_options: options,
            metadata: Default::default(),
            checksum: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn absent_options_get_worker_defaults() {
        let request = request_from_event(created(None));
        assert_eq!(request.options.max_retries, 3);
        assert_eq!(request.options.max_speed, 0);
        assert_eq!(request.options.timeout, Duration::from_secs(30 * 60));
        assert_eq!(request.options.concurrency, 1);
    }

    #[test]
    fn present_options_are_honored() {
        let request = request_from_event(created(Some(WireOptions {
            concurrency: Some(4),
            max_speed: Some(1024),
            max_retries: Some(0),
            timeout: Some(60),
        })));
        assert_eq!(request.options.concurrency, 4);
        assert_eq!(request.options.max_speed, 1024);
        assert_eq!(request.options.max_retries, 0);
        assert_eq!(request.options.timeout, Duration::from_secs(60));
    }

    #[test]
    fn zero_timeout_means_default() {
        let request = request_from_event(created(Some(WireOptions {
            timeout: Some(0),
            ..Default::default()
        })));
        assert_eq!(request.options.timeout, Duration::from_secs(30 * 60));
    }
}
