//! Subscription loops feeding bus messages to handlers.

use std::sync::Arc;

use async_trait::async_trait;
use messaging::{DeadLetterErrorType, EventPublisher, Message, MessagingError, Subscription};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Result, SagaError};

/// Consumes messages from one or more topics.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Service name recorded on dead-lettered messages.
    fn service(&self) -> &'static str;

    /// Processes one message.
    async fn handle(&self, message: &Message) -> Result<()>;
}

/// Delivers messages from a subscription to a handler until shutdown.
///
/// A failing message is dead-lettered and the loop moves on.
pub struct EventListener<H: MessageHandler> {
    subscription: Subscription,
    handler: Arc<H>,
    publisher: EventPublisher,
}

impl<H: MessageHandler> EventListener<H> {
    pub fn new(subscription: Subscription, handler: Arc<H>, publisher: EventPublisher) -> Self {
        Self {
            subscription,
            handler,
            publisher,
        }
    }

    /// Runs the loop on a new task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let topic = self.subscription.topic().to_string();
        tracing::info!(%topic, service = self.handler.service(), "Listener started");

        loop {
            tokio::select! {
                message = self.subscription.recv() => {
                    match message {
                        Some(message) => self.deliver(&message).await,
                        None => {
                            tracing::warn!(%topic, "Subscription closed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!(%topic, "Listener stopped");
    }

    /// Handles one message, dead-lettering it on failure.
    #[tracing::instrument(skip(self, message), fields(topic = %message.topic, key = %message.key))]
    pub async fn deliver(&self, message: &Message) {
        let Err(e) = self.handler.handle(message).await else {
            metrics::counter!("events_consumed_total", "topic" => message.topic.clone())
                .increment(1);
            return;
        };

        let error_type = match &e {
            SagaError::Messaging(MessagingError::Malformed { .. }) => {
                DeadLetterErrorType::MalformedEvent
            }
            _ => DeadLetterErrorType::UnexpectedError,
        };
        tracing::error!(error = %e, ?error_type, "Failed to handle message");

        if let Err(dlq) = self
            .publisher
            .dead_letter(message, error_type, &e.to_string(), self.handler.service())
            .await
        {
            tracing::error!(error = %dlq, "Failed to dead-letter message");
        }
    }
}
