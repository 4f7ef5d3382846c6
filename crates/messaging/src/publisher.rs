use std::sync::Arc;
use std::time::Duration;

use crate::bus::{Message, MessageBus};
use crate::dead_letter::{DeadLetterErrorType, DeadLetterMessage};
use crate::{Event, MessagingError, Result};

/// Retry policy for outbound events.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `backoff * n` before the next try.
    pub backoff: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Shared outbound publisher. One instance per service, cloned freely.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    config: PublisherConfig,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, config: PublisherConfig) -> Self {
        Self { bus, config }
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Serializes and sends `event` with linear-backoff retries.
    ///
    /// After the last failed attempt the error is logged and returned as
    /// `PublishExhausted`; callers treat it as non-fatal.
    #[tracing::instrument(skip(self, event), fields(topic = event.topic(), event = event.name()))]
    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let topic = event.topic();
        let key = event.key();
        let attempts = self.config.max_attempts.max(1);

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.bus.send(Message::new(topic, &key, &payload)).await {
                Ok(()) => {
                    metrics::counter!("events_published_total", "topic" => topic).increment(1);
                    tracing::debug!(%key, attempt, "Event published");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(%key, attempt, error = %e, "Publish attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.backoff * attempt).await;
                    }
                }
            }
        }

        metrics::counter!("events_publish_failures_total", "topic" => topic).increment(1);
        tracing::error!(%key, attempts, error = %last_error, "Giving up on event");
        Err(MessagingError::PublishExhausted {
            topic: topic.to_string(),
            attempts,
            last_error,
        })
    }

    /// Routes an unprocessable inbound message to the dead-letter queue.
    pub async fn dead_letter(
        &self,
        original: &Message,
        error_type: DeadLetterErrorType,
        error: &str,
        service: &str,
    ) -> Result<()> {
        metrics::counter!("events_dead_lettered_total", "topic" => original.topic.clone())
            .increment(1);
        tracing::warn!(
            topic = %original.topic,
            key = %original.key,
            ?error_type,
            error,
            "Dead-lettering message"
        );

        let message = DeadLetterMessage::new(&original.payload, error_type, error, service);
        self.publish(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryMessageBus, OrderResponseMessage, topics};
    use common::{OrderId, SagaId};

    fn publisher(bus: &InMemoryMessageBus) -> EventPublisher {
        EventPublisher::new(Arc::new(bus.clone()), PublisherConfig::default())
    }

    fn response() -> OrderResponseMessage {
        OrderResponseMessage {
            order_id: OrderId::new(1),
            correlation_id: None,
            saga_id: SagaId::new(),
            status: "WAITING".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let bus = InMemoryMessageBus::new();
        bus.fail_next_sends(2).await;

        let start = tokio::time::Instant::now();
        publisher(&bus).publish(&response()).await.unwrap();

        assert_eq!(bus.send_attempts().await, 3);
        assert_eq!(bus.published(topics::ORDER_RESPONSE).await.len(), 1);
        // 1s after the first failure, 2s after the second
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let bus = InMemoryMessageBus::new();
        bus.fail_next_sends(5).await;

        let result = publisher(&bus).publish(&response()).await;

        match result {
            Err(MessagingError::PublishExhausted { topic, attempts, .. }) => {
                assert_eq!(topic, topics::ORDER_RESPONSE);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected PublishExhausted, got {other:?}"),
        }
        assert_eq!(bus.send_attempts().await, 3);
        assert!(bus.published(topics::ORDER_RESPONSE).await.is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_keeps_original_payload() {
        let bus = InMemoryMessageBus::new();
        let original = Message::new(topics::PAYMENT_EVENTS, "7", "{oops");

        publisher(&bus)
            .dead_letter(
                &original,
                DeadLetterErrorType::MalformedEvent,
                "bad json",
                "order-service",
            )
            .await
            .unwrap();

        let letters = bus.published(topics::DEAD_LETTER_QUEUE).await;
        assert_eq!(letters.len(), 1);
        let decoded: DeadLetterMessage = serde_json::from_str(&letters[0].payload).unwrap();
        assert_eq!(decoded.original_message, "{oops");
        assert_eq!(decoded.error_type, DeadLetterErrorType::MalformedEvent);
    }
}
