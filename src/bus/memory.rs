//! In-process bus built on per-subscriber unbounded queues.
//!
//! Fan-out: every subscriber of a topic receives every message published to
//! it. Delivery order is preserved per subscriber except for nacked messages,
//! which re-enter that subscriber's queue after the back-off.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{BusError, Delivery, Message, Publisher, Result, Subscriber, Subscription};

pub const DEFAULT_REDELIVERY_BACKOFF: Duration = Duration::from_millis(100);

pub struct InMemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>>,
    redelivery_backoff: Duration,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_redelivery_backoff(DEFAULT_REDELIVERY_BACKOFF)
    }

    pub fn with_redelivery_backoff(backoff: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            redelivery_backoff: backoff,
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            debug!(topic, "no subscribers, message dropped");
            return Ok(());
        };

        // Prune subscriptions whose receiving half is gone.
        subscribers.retain(|tx| {
            let delivery = Delivery::new(message.clone(), tx.clone(), self.redelivery_backoff);
            tx.send(delivery).is_ok()
        });

        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        if topic.is_empty() {
            return Err(BusError::SubscribeFailed("empty topic".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("task.created").await.unwrap();
        let mut b = bus.subscribe("task.created").await.unwrap();

        bus.publish("task.created", Message::new("hello"))
            .await
            .unwrap();

        let da = a.recv().await.unwrap();
        let db = b.recv().await.unwrap();
        assert_eq!(&da.message.payload[..], b"hello");
        assert_eq!(&db.message.payload[..], b"hello");
        da.ack();
        db.ack();
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = InMemoryBus::new();
        let mut created = bus.subscribe("task.created").await.unwrap();
        let mut paused = bus.subscribe("task.paused").await.unwrap();

        bus.publish("task.paused", Message::new("p")).await.unwrap();

        let delivery = paused.recv().await.unwrap();
        assert_eq!(&delivery.message.payload[..], b"p");
        delivery.ack();

        // Nothing arrived on the other topic.
        assert!(tokio::time::timeout(Duration::from_millis(20), created.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn nack_redelivers_after_backoff() {
        let bus = InMemoryBus::with_redelivery_backoff(Duration::from_millis(10));
        let mut sub = bus.subscribe("task.created").await.unwrap();

        bus.publish("task.created", Message::new("again"))
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        let started = std::time::Instant::now();
        first.nack();

        let second = sub.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(&second.message.payload[..], b"again");
        second.ack();
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("task.created").await.unwrap();
        drop(sub);

        bus.publish("task.created", Message::new("x")).await.unwrap();
        assert!(bus.topics.lock().get("task.created").unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_metadata_round_trips() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("task.completed").await.unwrap();

        let msg = Message::new("{}")
            .with_metadata("eventType", "TaskCompleted")
            .with_metadata("taskID", "9");
        bus.publish("task.completed", msg).await.unwrap();

        let delivery = sub.recv().await.unwrap();
        assert_eq!(
            delivery.message.metadata.get("eventType").map(String::as_str),
            Some("TaskCompleted")
        );
        assert_eq!(
            delivery.message.metadata.get("taskID").map(String::as_str),
            Some("9")
        );
        delivery.ack();
    }
}
