use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::{Money, OrderId, PaymentId};
use domain::{NewPayment, Payment, PaymentStatus};
use messaging::{EventPublisher, PaymentEvent};
use store::{PaymentRepository, StoreError};

use crate::{PaymentConfig, PaymentError, Result};

/// Creates, cancels and reads payments.
pub struct PaymentProcessor {
    payments: Arc<dyn PaymentRepository>,
    publisher: EventPublisher,
    config: PaymentConfig,
    save_attempts: AtomicU64,
}

impl PaymentProcessor {
    pub fn new(
        payments: Arc<dyn PaymentRepository>,
        publisher: EventPublisher,
        config: PaymentConfig,
    ) -> Self {
        Self {
            payments,
            publisher,
            config,
            save_attempts: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    /// Number of save attempts made so far, including failed ones.
    pub fn save_attempts(&self) -> u64 {
        self.save_attempts.load(Ordering::Relaxed)
    }

    /// Creates the payment for `order_id`, or returns the one that exists.
    #[tracing::instrument(skip(self), fields(%order_id, %amount))]
    pub async fn create_payment(&self, order_id: OrderId, amount: Money) -> Result<Payment> {
        if let Some(existing) = self.payments.find_payment_by_order(order_id).await? {
            tracing::info!(payment_id = %existing.id, "Payment already exists for order");
            return Ok(existing);
        }

        if amount < self.config.min_amount {
            let reason = format!(
                "Amount {amount} is below the minimum of {}",
                self.config.min_amount
            );
            tracing::warn!(%reason, "Payment declined");
            metrics::counter!("payment_declined_total").increment(1);
            self.announce(PaymentEvent::failed(order_id, amount, &reason))
                .await;
            return Err(PaymentError::Declined { order_id, reason });
        }

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            metrics::counter!("payment_attempts_total").increment(1);

            match self.save(order_id, amount).await {
                Ok(payment) => {
                    tracing::info!(payment_id = %payment.id, attempt, "Payment processed");
                    self.announce(PaymentEvent::processed(
                        payment.id,
                        order_id,
                        payment.amount,
                        payment.status.as_str(),
                    ))
                    .await;
                    return Ok(payment);
                }
                Err(StoreError::UniqueViolation { .. }) => {
                    // A concurrent request for the same order won the insert.
                    return match self.payments.find_payment_by_order(order_id).await? {
                        Some(winner) => {
                            tracing::info!(payment_id = %winner.id, "Concurrent payment won the race");
                            Ok(winner)
                        }
                        None => Err(PaymentError::Store(StoreError::NotFound(format!(
                            "payment for order {order_id}"
                        )))),
                    };
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt, error = %e, "Payment save failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(attempts, error = %last_error, "Payment unavailable after retries");
        metrics::counter!("payment_unavailable_total").increment(1);
        self.announce(PaymentEvent::failed(
            order_id,
            amount,
            format!("Payment storage unavailable: {last_error}"),
        ))
        .await;

        Err(PaymentError::Unavailable {
            order_id,
            attempts,
            reason: last_error,
        })
    }

    /// Marks a payment cancelled. Cancelling twice is a no-op.
    #[tracing::instrument(skip(self), fields(%payment_id))]
    pub async fn cancel_payment(&self, payment_id: PaymentId) -> Result<Payment> {
        let payment = self
            .payments
            .find_payment(payment_id)
            .await?
            .ok_or(PaymentError::NotFound(payment_id))?;

        if payment.status == PaymentStatus::Cancelled {
            tracing::debug!("Payment already cancelled");
            return Ok(payment);
        }

        let cancelled = self
            .payments
            .update_payment_status(payment_id, PaymentStatus::Cancelled)
            .await?
            .ok_or(PaymentError::NotFound(payment_id))?;

        tracing::info!(order_id = %cancelled.order_id, "Payment cancelled");
        self.announce(PaymentEvent::cancelled(payment_id, cancelled.order_id))
            .await;
        Ok(cancelled)
    }

    pub async fn get_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>> {
        Ok(self.payments.find_payment(payment_id).await?)
    }

    async fn save(&self, order_id: OrderId, amount: Money) -> std::result::Result<Payment, StoreError> {
        self.save_attempts.fetch_add(1, Ordering::Relaxed);

        if self.config.fault_sentinel == Some(amount) {
            return Err(StoreError::Unavailable(format!(
                "simulated storage fault for amount {amount}"
            )));
        }

        self.payments
            .insert_payment(NewPayment::completed(order_id, amount))
            .await
    }

    async fn announce(&self, event: PaymentEvent) {
        if let Err(e) = self.publisher.publish(&event).await {
            tracing::error!(error = %e, event = event.event_type.as_str(), "Failed to publish payment event");
        }
    }
}
