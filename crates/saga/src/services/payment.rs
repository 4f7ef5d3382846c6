//! Synchronous payment contract used by the orchestrator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Money, OrderId, PaymentId};
use domain::{Payment, PaymentStatus};
use payment::{PaymentError, PaymentProcessor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// What the payment service answers to a successful create call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub amount: Money,
    pub status: PaymentStatus,
    pub processed_at: DateTime<Utc>,
}

impl From<Payment> for PaymentReceipt {
    fn from(payment: Payment) -> Self {
        Self {
            id: payment.id,
            order_id: payment.order_id,
            amount: payment.amount,
            status: payment.status,
            processed_at: payment.processed_at,
        }
    }
}

/// Payment call failures as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentClientError {
    /// Rejected by a business rule; the failure event follows on the bus.
    #[error("Payment declined: {0}")]
    Declined(String),

    /// The payment service could not complete the call.
    #[error("Payment service unavailable: {0}")]
    Unavailable(String),

    #[error("Payment not found: {0}")]
    NotFound(PaymentId),
}

/// Trait for synchronous payment operations.
#[async_trait]
pub trait PaymentClient: Send + Sync {
    /// Creates (or returns the existing) payment for an order.
    async fn create_payment(
        &self,
        order_id: OrderId,
        amount: Money,
    ) -> Result<PaymentReceipt, PaymentClientError>;

    /// Cancels a payment. Cancelling twice succeeds.
    async fn cancel_payment(&self, payment_id: PaymentId) -> Result<(), PaymentClientError>;
}

/// Calls a [`PaymentProcessor`] running in the same process.
#[derive(Clone)]
pub struct InProcessPaymentClient {
    processor: Arc<PaymentProcessor>,
}

impl InProcessPaymentClient {
    pub fn new(processor: Arc<PaymentProcessor>) -> Self {
        Self { processor }
    }
}

impl From<PaymentError> for PaymentClientError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Declined { reason, .. } => PaymentClientError::Declined(reason),
            PaymentError::NotFound(id) => PaymentClientError::NotFound(id),
            other => PaymentClientError::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
impl PaymentClient for InProcessPaymentClient {
    async fn create_payment(
        &self,
        order_id: OrderId,
        amount: Money,
    ) -> Result<PaymentReceipt, PaymentClientError> {
        Ok(self.processor.create_payment(order_id, amount).await?.into())
    }

    async fn cancel_payment(&self, payment_id: PaymentId) -> Result<(), PaymentClientError> {
        self.processor.cancel_payment(payment_id).await?;
        Ok(())
    }
}

/// How the in-memory client answers `create_payment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaymentBehavior {
    #[default]
    Accept,
    Decline,
    Unavailable,
    /// Never answers; exercises the breaker's call timeout.
    Hang,
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<OrderId, PaymentReceipt>,
    cancelled: HashSet<PaymentId>,
    next_id: i64,
    behavior: PaymentBehavior,
    fail_on_cancel: bool,
    cancel_delay: Duration,
    create_calls: u32,
    cancel_calls: u32,
}

/// Scriptable payment client for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentClient {
    state: Arc<Mutex<InMemoryPaymentState>>,
}

impl InMemoryPaymentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_behavior(&self, behavior: PaymentBehavior) {
        self.state.lock().await.behavior = behavior;
    }

    pub async fn set_fail_on_cancel(&self, fail: bool) {
        self.state.lock().await.fail_on_cancel = fail;
    }

    /// Makes every `cancel_payment` call take `delay` before answering.
    pub async fn set_cancel_delay(&self, delay: Duration) {
        self.state.lock().await.cancel_delay = delay;
    }

    pub async fn cancel_calls(&self) -> u32 {
        self.state.lock().await.cancel_calls
    }

    /// Number of `create_payment` calls that reached the client.
    pub async fn create_calls(&self) -> u32 {
        self.state.lock().await.create_calls
    }

    pub async fn is_cancelled(&self, payment_id: PaymentId) -> bool {
        self.state.lock().await.cancelled.contains(&payment_id)
    }
}

#[async_trait]
impl PaymentClient for InMemoryPaymentClient {
    async fn create_payment(
        &self,
        order_id: OrderId,
        amount: Money,
    ) -> Result<PaymentReceipt, PaymentClientError> {
        {
            let mut state = self.state.lock().await;
            state.create_calls += 1;

            match state.behavior {
                PaymentBehavior::Accept => {
                    if let Some(existing) = state.payments.get(&order_id) {
                        return Ok(existing.clone());
                    }
                    state.next_id += 1;
                    let receipt = PaymentReceipt {
                        id: PaymentId::new(state.next_id),
                        order_id,
                        amount,
                        status: PaymentStatus::Completed,
                        processed_at: Utc::now(),
                    };
                    state.payments.insert(order_id, receipt.clone());
                    return Ok(receipt);
                }
                PaymentBehavior::Decline => {
                    return Err(PaymentClientError::Declined(format!(
                        "amount {amount} rejected"
                    )));
                }
                PaymentBehavior::Unavailable => {
                    return Err(PaymentClientError::Unavailable(
                        "payment service down".to_string(),
                    ));
                }
                PaymentBehavior::Hang => {}
            }
        }

        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(PaymentClientError::Unavailable("no answer".to_string()))
    }

    async fn cancel_payment(&self, payment_id: PaymentId) -> Result<(), PaymentClientError> {
        let delay = {
            let mut state = self.state.lock().await;
            state.cancel_calls += 1;
            state.cancel_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.fail_on_cancel {
            return Err(PaymentClientError::Unavailable(
                "cancel rejected".to_string(),
            ));
        }
        if !state.payments.values().any(|p| p.id == payment_id) {
            return Err(PaymentClientError::NotFound(payment_id));
        }
        state.cancelled.insert(payment_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_idempotent_per_order() {
        let client = InMemoryPaymentClient::new();
        let a = client
            .create_payment(OrderId::new(1), Money::from_dollars(20))
            .await
            .unwrap();
        let b = client
            .create_payment(OrderId::new(1), Money::from_dollars(20))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(client.create_calls().await, 2);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let client = InMemoryPaymentClient::new();

        client.set_behavior(PaymentBehavior::Decline).await;
        assert!(matches!(
            client.create_payment(OrderId::new(1), Money::from_dollars(5)).await,
            Err(PaymentClientError::Declined(_))
        ));

        client.set_behavior(PaymentBehavior::Unavailable).await;
        assert!(matches!(
            client.create_payment(OrderId::new(1), Money::from_dollars(50)).await,
            Err(PaymentClientError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel() {
        let client = InMemoryPaymentClient::new();
        let receipt = client
            .create_payment(OrderId::new(1), Money::from_dollars(20))
            .await
            .unwrap();

        client.cancel_payment(receipt.id).await.unwrap();
        assert!(client.is_cancelled(receipt.id).await);
        assert!(matches!(
            client.cancel_payment(PaymentId::new(99)).await,
            Err(PaymentClientError::NotFound(_))
        ));
    }

    #[test]
    fn test_processor_errors_map_to_client_errors() {
        let declined = PaymentError::Declined {
            order_id: OrderId::new(1),
            reason: "too small".to_string(),
        };
        assert_eq!(
            PaymentClientError::from(declined),
            PaymentClientError::Declined("too small".to_string())
        );

        let unavailable = PaymentError::Unavailable {
            order_id: OrderId::new(1),
            attempts: 3,
            reason: "db down".to_string(),
        };
        assert!(matches!(
            PaymentClientError::from(unavailable),
            PaymentClientError::Unavailable(_)
        ));
    }
}
