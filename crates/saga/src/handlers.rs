//! Reactions of the order service to inbound events.

use std::sync::Arc;

use async_trait::async_trait;
use common::OrderId;
use domain::{NewOrder, SagaStatus};
use messaging::{
    Message, MessagingError, OrderCreatedEvent, OrderResponseMessage, PaymentEvent,
    PaymentEventType, decode, topics,
};
use store::{OrderRepository, ProcessedEventRepository, SagaRepository};

use crate::error::{Result, SagaError};
use crate::listener::MessageHandler;
use crate::orchestrator::{SagaOrchestrator, SagaStore};

/// Consumer name used for deduplication and dead-letter records.
pub const ORDER_SERVICE: &str = "order-service";

/// Handles `order-events` and `payment-events` for the orchestrator.
pub struct OrderEventHandler<S: SagaStore> {
    orchestrator: Arc<SagaOrchestrator<S>>,
}

impl<S: SagaStore> OrderEventHandler<S> {
    pub fn new(orchestrator: Arc<SagaOrchestrator<S>>) -> Self {
        Self { orchestrator }
    }

    /// Persists the order, starts its saga, answers the gateway and requests
    /// payment.
    ///
    /// The order row is keyed by the saga ID, so a redelivery, or a delivery
    /// racing another one, reuses the same order instead of adding a new one.
    #[tracing::instrument(skip(self, event), fields(saga_id = %event.saga_id))]
    pub async fn handle_order_created(&self, event: OrderCreatedEvent) -> Result<()> {
        let store = self.orchestrator.store();

        if let Some(saga) = store.find_saga(event.saga_id).await? {
            tracing::info!(order_id = %saga.order_id, "Duplicate OrderCreated, re-sending response");
            let status = match store.find_order(saga.order_id).await? {
                Some(order) => order.status.as_str().to_string(),
                None => saga.status.as_str().to_string(),
            };
            self.respond(&event, saga.order_id, status).await;
            return Ok(());
        }

        let order = store
            .insert_order_for_saga(
                event.saga_id,
                NewOrder::new(
                    event.customer_id.clone(),
                    event.product_id.clone(),
                    event.quantity,
                    event.amount,
                ),
            )
            .await?;

        match self
            .orchestrator
            .start_saga_with_id(event.saga_id, &order)
            .await
        {
            Ok(_) => {}
            Err(SagaError::AlreadyStarted(_)) => {
                tracing::info!(order_id = %order.id, "Saga started by a concurrent delivery");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        metrics::counter!("orders_created_total").increment(1);
        self.respond(&event, order.id, order.status.as_str().to_string())
            .await;

        let outcome = self.orchestrator.request_payment(order.id).await?;
        tracing::info!(order_id = %order.id, ?outcome, "Payment requested");
        Ok(())
    }

    /// Applies a payment event to the matching saga.
    ///
    /// Events already handled by this consumer are dropped. The key is only
    /// recorded once the event was applied, so a delivery that failed midway
    /// is retried in full on redelivery.
    #[tracing::instrument(skip(self, event), fields(order_id = %event.order_id, event_type = event.event_type.as_str()))]
    pub async fn handle_payment_event(&self, event: PaymentEvent) -> Result<()> {
        let store = self.orchestrator.store();
        let key = event.idempotency_key;

        if store.is_processed(ORDER_SERVICE, key).await? {
            tracing::debug!(%key, "Duplicate payment event skipped");
            metrics::counter!("events_duplicates_total").increment(1);
            return Ok(());
        }

        self.apply_payment_event(event).await?;

        if !store.mark_processed(ORDER_SERVICE, key).await? {
            tracing::debug!(%key, "Payment event applied by a concurrent delivery");
        }
        Ok(())
    }

    async fn apply_payment_event(&self, event: PaymentEvent) -> Result<()> {
        let order_id = event.order_id;
        let saga = self
            .orchestrator
            .get_saga_state(order_id)
            .await?
            .ok_or(SagaError::NotFound(order_id))?;

        let result = match event.event_type {
            PaymentEventType::PaymentProcessed => {
                let payment_id = event.payment_id.ok_or_else(|| {
                    SagaError::Messaging(MessagingError::Malformed {
                        topic: topics::PAYMENT_EVENTS.to_string(),
                        reason: "PaymentProcessed without paymentId".to_string(),
                    })
                })?;
                match self.orchestrator.process_payment(order_id, payment_id).await {
                    Ok(_) => self.orchestrator.complete_saga(order_id).await.map(|_| ()),
                    Err(e)
                        if e.is_superseded()
                            || matches!(e, SagaError::PaymentAlreadyAttached { .. }) =>
                    {
                        // A charge landing on a saga that already ended must be undone.
                        if self
                            .orchestrator
                            .cancel_late_payment(order_id, payment_id)
                            .await?
                        {
                            Ok(())
                        } else {
                            Err(e)
                        }
                    }
                    Err(e) => Err(e),
                }
            }
            PaymentEventType::PaymentFailed => {
                let reason = event
                    .reason
                    .unwrap_or_else(|| "Payment failed".to_string());
                match saga.status {
                    SagaStatus::Waiting => self
                        .orchestrator
                        .fail_saga(order_id, &reason)
                        .await
                        .map(|_| ()),
                    SagaStatus::Processing => self
                        .orchestrator
                        .compensate(&saga, &reason)
                        .await
                        .map(|_| ()),
                    other => {
                        tracing::debug!(status = %other, "PaymentFailed ignored");
                        Ok(())
                    }
                }
            }
            PaymentEventType::PaymentCancelled => match saga.status {
                SagaStatus::Processing => self
                    .orchestrator
                    .refund_payment(order_id)
                    .await
                    .map(|_| ()),
                other => {
                    tracing::debug!(status = %other, "PaymentCancelled ignored");
                    Ok(())
                }
            },
        };

        match result {
            Err(e) if e.is_superseded() => {
                tracing::debug!(error = %e, "Saga already moved on");
                Ok(())
            }
            other => other,
        }
    }

    async fn respond(&self, event: &OrderCreatedEvent, order_id: OrderId, status: String) {
        let response = OrderResponseMessage {
            order_id,
            correlation_id: event.correlation_id,
            saga_id: event.saga_id,
            status,
        };
        if let Err(e) = self.orchestrator.publisher().publish(&response).await {
            tracing::error!(error = %e, "Failed to publish order response");
        }
    }
}

#[async_trait]
impl<S: SagaStore> MessageHandler for OrderEventHandler<S> {
    fn service(&self) -> &'static str {
        ORDER_SERVICE
    }

    async fn handle(&self, message: &Message) -> Result<()> {
        match message.topic.as_str() {
            topics::ORDER_EVENTS => self.handle_order_created(decode(message)?).await,
            topics::PAYMENT_EVENTS => self.handle_payment_event(decode(message)?).await,
            other => {
                tracing::warn!(topic = other, "No handler for topic");
                Ok(())
            }
        }
    }
}
