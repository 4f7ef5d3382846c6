//! Kafka-backed [`MessageBus`], enabled with the `kafka` feature.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::mpsc;

use crate::bus::{Message, MessageBus, Subscription};
use crate::{MessagingError, Result};

/// Connection settings for [`KafkaMessageBus`].
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma separated `host:port` list.
    pub brokers: String,
    /// Consumer group shared by every subscription of this process.
    pub group_id: String,
    /// How long the producer may hold a message before failing delivery.
    pub message_timeout: Duration,
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            message_timeout: Duration::from_secs(5),
        }
    }
}

/// Message bus over a Kafka cluster.
///
/// Keys and payloads are sent as UTF-8. Each subscription runs its own
/// consumer in the shared group and commits offsets once a record has been
/// handed to the subscriber.
pub struct KafkaMessageBus {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl KafkaMessageBus {
    pub fn connect(config: KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| MessagingError::Unavailable(format!("producer creation failed: {e}")))?;

        tracing::info!(brokers = %config.brokers, group_id = %config.group_id, "Connected Kafka producer");
        Ok(Self { producer, config })
    }

    fn consumer(&self) -> Result<StreamConsumer> {
        ClientConfig::new()
            .set("group.id", &self.config.group_id)
            .set("bootstrap.servers", &self.config.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| MessagingError::Unavailable(format!("consumer creation failed: {e}")))
    }
}

#[async_trait]
impl MessageBus for KafkaMessageBus {
    async fn send(&self, message: Message) -> Result<()> {
        let record = FutureRecord::to(&message.topic)
            .key(message.key.as_str())
            .payload(message.payload.as_str())
            .timestamp(message.timestamp.timestamp_millis());

        self.producer
            .send(record, Duration::from_secs(0))
            .await
            .map(|_| ())
            .map_err(|(e, _)| {
                MessagingError::Unavailable(format!("delivery to {} failed: {e}", message.topic))
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let consumer = self.consumer()?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| MessagingError::Unavailable(format!("subscribe to {topic} failed: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = topic.to_string();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    received = consumer.recv() => received,
                    _ = tx.closed() => break,
                };
                let record = match received {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(topic = %name, error = %e, "Kafka receive failed");
                        continue;
                    }
                };

                let payload = match record.payload_view::<str>() {
                    Some(Ok(payload)) => payload.to_string(),
                    Some(Err(e)) => {
                        tracing::warn!(topic = %name, offset = record.offset(), error = %e, "Skipping non UTF-8 payload");
                        continue;
                    }
                    None => String::new(),
                };
                let key = match record.key_view::<str>() {
                    Some(Ok(key)) => key.to_string(),
                    _ => String::new(),
                };
                let timestamp = record
                    .timestamp()
                    .to_millis()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .unwrap_or_else(Utc::now);

                let message = Message {
                    topic: record.topic().to_string(),
                    key,
                    payload,
                    timestamp,
                };
                if tx.send(message).is_err() {
                    break;
                }
                if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                    tracing::warn!(topic = %name, error = %e, "Offset commit failed");
                }
            }
            tracing::debug!(topic = %name, "Kafka subscription closed");
        });

        Ok(Subscription::new(topic, rx))
    }
}
