use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use tokio::sync::{Mutex, mpsc};

use crate::{MessagingError, Result};

/// A keyed message on a topic. Payloads are JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub key: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Broker seam. Delivery is at-least-once; consumers dedupe by idempotency key.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Hands one message to the broker.
    async fn send(&self, message: Message) -> Result<()>;

    /// Opens a subscription receiving every message sent to `topic` from now on.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// Receiving end of a topic subscription, in send order.
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub(crate) fn new(topic: impl Into<String>, receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message. Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Returns a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Messages kept in the published log unless configured otherwise.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

struct BusState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    log: VecDeque<Message>,
    log_capacity: usize,
    failures_remaining: u32,
    send_attempts: u64,
}

/// In-process broker with one FIFO queue per subscription.
///
/// Keeps a log of the most recent accepted messages and can be told to
/// reject the next sends, which is how publisher retries are exercised.
#[derive(Clone)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` messages in the published log, dropping the
    /// oldest first. Zero disables the log.
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                subscribers: HashMap::new(),
                log: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
                log_capacity: capacity,
                failures_remaining: 0,
                send_attempts: 0,
            })),
        }
    }

    /// A bus that keeps no published log, for long-running processes.
    pub fn without_log() -> Self {
        Self::with_log_capacity(0)
    }

    /// Makes the next `count` sends fail with `Unavailable`.
    pub async fn fail_next_sends(&self, count: u32) {
        self.state.lock().await.failures_remaining = count;
    }

    /// Messages accepted on `topic` that are still in the log, oldest first.
    pub async fn published(&self, topic: &str) -> Vec<Message> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of send calls, including rejected ones.
    pub async fn send_attempts(&self) -> u64 {
        self.state.lock().await.send_attempts
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn send(&self, message: Message) -> Result<()> {
        let mut state = self.state.lock().await;
        state.send_attempts += 1;

        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(MessagingError::Unavailable(format!(
                "broker rejected message for {}",
                message.topic
            )));
        }

        if let Some(senders) = state.subscribers.get_mut(&message.topic) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
        if state.log_capacity > 0 {
            if state.log.len() == state.log_capacity {
                state.log.pop_front();
            }
            state.log.push_back(message);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .await
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        Ok(Subscription::new(topic, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe("orders").await.unwrap();

        bus.send(Message::new("orders", "k1", "one")).await.unwrap();
        bus.send(Message::new("orders", "k1", "two")).await.unwrap();
        bus.send(Message::new("other", "k1", "ignored")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().payload, "one");
        assert_eq!(sub.next().await.unwrap().payload, "two");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_a_copy() {
        let bus = InMemoryMessageBus::new();
        let mut a = bus.subscribe("t").await.unwrap();
        let mut b = bus.subscribe("t").await.unwrap();

        bus.send(Message::new("t", "k", "x")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().payload, "x");
        assert_eq!(b.recv().await.unwrap().payload, "x");
    }

    #[tokio::test]
    async fn test_injected_failures_are_not_logged() {
        let bus = InMemoryMessageBus::new();
        bus.fail_next_sends(1).await;

        let first = bus.send(Message::new("t", "k", "x")).await;
        assert!(matches!(first, Err(MessagingError::Unavailable(_))));
        bus.send(Message::new("t", "k", "y")).await.unwrap();

        let log = bus.published("t").await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].payload, "y");
        assert_eq!(bus.send_attempts().await, 2);
    }

    #[tokio::test]
    async fn test_log_keeps_only_the_most_recent_messages() {
        let bus = InMemoryMessageBus::with_log_capacity(2);
        let mut sub = bus.subscribe("t").await.unwrap();

        for payload in ["a", "b", "c"] {
            bus.send(Message::new("t", "k", payload)).await.unwrap();
        }

        let log: Vec<_> = bus
            .published("t")
            .await
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(log, vec!["b", "c"]);
        // Subscribers are unaffected by the log bound.
        assert_eq!(sub.recv().await.unwrap().payload, "a");
    }

    #[tokio::test]
    async fn test_bus_without_log_still_delivers() {
        let bus = InMemoryMessageBus::without_log();
        let mut sub = bus.subscribe("t").await.unwrap();

        bus.send(Message::new("t", "k", "x")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().payload, "x");
        assert!(bus.published("t").await.is_empty());
        assert_eq!(bus.send_attempts().await, 1);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = InMemoryMessageBus::new();
        let sub = bus.subscribe("t").await.unwrap();
        drop(sub);

        bus.send(Message::new("t", "k", "x")).await.unwrap();
        assert_eq!(bus.published("t").await.len(), 1);
    }
}
