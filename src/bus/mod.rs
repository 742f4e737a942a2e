//! Message bus abstraction.
//!
//! The worker talks to the task service exclusively through topics on a
//! pub/sub bus with at-least-once delivery. Consumers acknowledge each
//! delivery; a negative acknowledgement causes redelivery after a back-off.
//!
//! [`memory::InMemoryBus`] is the in-process implementation used by the
//! single-process deployment and the test suite.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}

pub type Result<T> = std::result::Result<T, BusError>;

/// A bus message: opaque payload plus routing metadata.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload: payload.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Message producer side of the bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<()>;
}

/// Message consumer side of the bus.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// A message handed to a consumer, with its acknowledgement handle.
///
/// Dropping a delivery without calling [`ack`](Delivery::ack) or
/// [`nack`](Delivery::nack) acts as an ack; redelivery only happens on an
/// explicit nack.
pub struct Delivery {
    pub message: Message,
    redeliver: RedeliverHandle,
}

struct RedeliverHandle {
    queue: mpsc::UnboundedSender<Delivery>,
    backoff: std::time::Duration,
}

impl Delivery {
    pub(crate) fn new(
        message: Message,
        queue: mpsc::UnboundedSender<Delivery>,
        backoff: std::time::Duration,
    ) -> Self {
        Self {
            message,
            redeliver: RedeliverHandle { queue, backoff },
        }
    }

    /// Acknowledge successful processing.
    pub fn ack(self) {}

    /// Reject the message; it is redelivered on the same subscription after
    /// the bus back-off.
    pub fn nack(self) {
        let RedeliverHandle { queue, backoff } = self.redeliver;
        let message = self.message;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let redelivery = Delivery::new(message, queue.clone(), backoff);
            if queue.send(redelivery).is_err() {
                tracing::debug!("subscription closed, dropping redelivery");
            }
        });
    }
}

/// Receiving half of one subscription.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    /// Next delivery, or `None` once the bus side has been dropped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}
