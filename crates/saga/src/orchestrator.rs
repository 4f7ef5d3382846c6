//! Saga orchestrator driving the order/payment workflow.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId, SagaId};
use domain::{
    NewSagaEvent, Order, OrderStatus, SagaEvent, SagaState, SagaStatus, SagaStep,
};
use messaging::{CompensationEvent, EventPublisher};
use store::{
    OrderRepository, ProcessedEventRepository, SagaRepository, SagaTransition, StoreError,
};

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::services::payment::{PaymentClient, PaymentClientError};

/// Persistence the saga services need.
pub trait SagaStore:
    OrderRepository + SagaRepository + ProcessedEventRepository + Clone + 'static
{
}

impl<T> SagaStore for T where
    T: OrderRepository + SagaRepository + ProcessedEventRepository + Clone + 'static
{
}

/// Result of asking the payment service to charge an order.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    /// Payment accepted and attached; the saga is `Processing`.
    Accepted(SagaState),
    /// A business rule rejected the payment. The saga is left to the
    /// `PaymentFailed` event.
    Declined(String),
    /// The payment service was unreachable; the saga was compensated.
    Compensated(SagaState),
    /// The saga had already moved on; nothing was done.
    Skipped(SagaStatus),
}

/// Orchestrates order/payment sagas.
///
/// Every state change goes through one atomic store write that carries the
/// new saga state, the order status and the audit row together.
pub struct SagaOrchestrator<S: SagaStore> {
    store: S,
    payments: Arc<dyn PaymentClient>,
    breaker: Arc<CircuitBreaker>,
    publisher: EventPublisher,
    config: SagaConfig,
}

impl<S: SagaStore> SagaOrchestrator<S> {
    /// Creates a new saga orchestrator.
    pub fn new(
        store: S,
        payments: Arc<dyn PaymentClient>,
        breaker: Arc<CircuitBreaker>,
        publisher: EventPublisher,
        config: SagaConfig,
    ) -> Self {
        Self {
            store,
            payments,
            breaker,
            publisher,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Starts a saga for a persisted order under a fresh saga ID.
    pub async fn start_saga(&self, order: &Order) -> Result<SagaId> {
        let saga = self.start_saga_with_id(SagaId::new(), order).await?;
        Ok(saga.saga_id)
    }

    /// Starts a saga under a caller-chosen ID, so redelivered events map to
    /// the same saga.
    #[tracing::instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn start_saga_with_id(&self, saga_id: SagaId, order: &Order) -> Result<SagaState> {
        let timeout = chrono::Duration::from_std(self.config.saga_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let saga = SagaState::start(saga_id, order.id, timeout, Utc::now());

        let started = NewSagaEvent::saga_started(
            order.id,
            &order.customer_id,
            &order.product_id,
            order.quantity,
            order.amount,
        );

        match self.store.insert_saga(&saga, started).await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation { .. }) => {
                return Err(SagaError::AlreadyStarted(order.id));
            }
            Err(e) => return Err(e.into()),
        }

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(%saga_id, timeout_at = %saga.timeout_at, "saga started");
        Ok(saga)
    }

    /// Attaches an accepted payment: `Waiting -> Processing`.
    ///
    /// Repeating the call with the attached payment is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn process_payment(
        &self,
        order_id: OrderId,
        payment_id: PaymentId,
    ) -> Result<SagaState> {
        self.apply(order_id, |saga, now| {
            match saga.payment_id {
                Some(existing) if existing == payment_id => return Ok(None),
                Some(existing) => {
                    return Err(SagaError::PaymentAlreadyAttached {
                        order_id,
                        existing,
                        requested: payment_id,
                    });
                }
                None => {}
            }

            let mut next = advance(saga, SagaStatus::Processing, SagaStep::PaymentProcessing, now)?;
            next.payment_id = Some(payment_id);
            Ok(Some(SagaTransition {
                saga: next,
                event: NewSagaEvent::payment_processing(payment_id),
                order_status: Some(OrderStatus::Processing),
            }))
        })
        .await
    }

    /// `Processing -> Completed`.
    #[tracing::instrument(skip(self))]
    pub async fn complete_saga(&self, order_id: OrderId) -> Result<SagaState> {
        let saga = self
            .apply(order_id, |saga, now| {
                Ok(Some(SagaTransition {
                    saga: advance(saga, SagaStatus::Completed, SagaStep::PaymentCompleted, now)?,
                    event: NewSagaEvent::saga_completed(),
                    order_status: Some(OrderStatus::Completed),
                }))
            })
            .await?;

        metrics::counter!("saga_completed_total").increment(1);
        Ok(saga)
    }

    /// Marks the saga failed after a payment failure.
    #[tracing::instrument(skip(self))]
    pub async fn fail_saga(&self, order_id: OrderId, reason: &str) -> Result<SagaState> {
        let saga = self
            .apply(order_id, |saga, now| {
                Ok(Some(SagaTransition {
                    saga: advance(saga, SagaStatus::Failed, SagaStep::PaymentFailed, now)?,
                    event: NewSagaEvent::saga_failed(reason),
                    order_status: Some(OrderStatus::Failed),
                }))
            })
            .await?;

        metrics::counter!("saga_failed_total").increment(1);
        tracing::warn!(%reason, "saga failed");
        Ok(saga)
    }

    /// `Processing -> Refunded`, after the payment was cancelled externally.
    #[tracing::instrument(skip(self))]
    pub async fn refund_payment(&self, order_id: OrderId) -> Result<SagaState> {
        self.apply(order_id, |saga, now| {
            Ok(Some(SagaTransition {
                saga: advance(saga, SagaStatus::Refunded, SagaStep::PaymentRefunded, now)?,
                event: NewSagaEvent::payment_refunded(),
                order_status: Some(OrderStatus::Refunded),
            }))
        })
        .await
    }

    /// `Waiting -> NoPayment` once the payment deadline has passed.
    #[tracing::instrument(skip(self, saga), fields(order_id = %saga.order_id))]
    pub async fn time_out(&self, saga: &SagaState) -> Result<SagaState> {
        let saga = self
            .apply(saga.order_id, |saga, now| {
                Ok(Some(SagaTransition {
                    saga: advance(saga, SagaStatus::NoPayment, SagaStep::Timeout, now)?,
                    event: NewSagaEvent::saga_timeout(),
                    order_status: Some(OrderStatus::Failed),
                }))
            })
            .await?;

        metrics::counter!("saga_timeouts_total").increment(1);
        tracing::warn!("saga timed out waiting for payment");
        Ok(saga)
    }

    /// Runs the compensation protocol and leaves the saga `Failed`.
    ///
    /// Cancelling the payment and publishing the cancellation events are best
    /// effort: their failures are logged and recorded in the audit row but
    /// never stop the saga from reaching `Failed`. Only the caller that moves
    /// the saga into `Compensating` runs the side effects; anyone finding it
    /// already there gets `CompensationInProgress`.
    pub async fn compensate(&self, saga: &SagaState, reason: &str) -> Result<SagaState> {
        self.run_compensation(saga, reason, false).await
    }

    /// Like [`compensate`](Self::compensate), but also finishes a saga left in
    /// `Compensating` by a process that died mid-run. Only the startup
    /// recovery pass may call this.
    pub async fn resume_compensation(&self, saga: &SagaState, reason: &str) -> Result<SagaState> {
        self.run_compensation(saga, reason, true).await
    }

    #[tracing::instrument(skip(self, saga), fields(order_id = %saga.order_id, saga_id = %saga.saga_id))]
    async fn run_compensation(
        &self,
        saga: &SagaState,
        reason: &str,
        resume: bool,
    ) -> Result<SagaState> {
        let order_id = saga.order_id;

        let compensating = self
            .apply(order_id, |saga, now| {
                if saga.status == SagaStatus::Compensating {
                    return if resume {
                        Ok(None)
                    } else {
                        Err(SagaError::CompensationInProgress(order_id))
                    };
                }
                if !saga.status.can_compensate() {
                    return Err(SagaError::InvalidTransition {
                        order_id,
                        from: saga.status,
                        to: SagaStatus::Compensating,
                    });
                }
                Ok(Some(SagaTransition {
                    saga: advance(saga, SagaStatus::Compensating, SagaStep::Compensating, now)?,
                    event: NewSagaEvent::compensation_started(order_id, reason),
                    order_status: None,
                }))
            })
            .await?;

        let payment_id = compensating.payment_id;
        let mut payment_cancelled = false;

        if let Some(payment_id) = payment_id {
            match self.payments.cancel_payment(payment_id).await {
                Ok(()) => {
                    payment_cancelled = true;
                    self.announce(CompensationEvent::payment_cancelled(payment_id, order_id))
                        .await;
                }
                Err(e) => {
                    tracing::error!(%payment_id, error = %e, "failed to cancel payment during compensation");
                }
            }
        }

        let order_cancelled = self
            .announce(CompensationEvent::order_cancelled(order_id))
            .await;

        let failed = self
            .apply(order_id, |saga, now| {
                Ok(Some(SagaTransition {
                    saga: advance(saga, SagaStatus::Failed, SagaStep::Compensated, now)?,
                    event: NewSagaEvent::compensation_completed(
                        payment_id,
                        payment_cancelled,
                        order_cancelled,
                    ),
                    order_status: Some(OrderStatus::Cancelled),
                }))
            })
            .await?;

        metrics::counter!("saga_compensations_total").increment(1);
        tracing::warn!(%reason, payment_cancelled, order_cancelled, "saga compensated");
        Ok(failed)
    }

    /// Cancels a payment reported processed for a saga that ended without it,
    /// for instance after the payment call timed out and the saga was
    /// compensated. Best effort and not audited. Returns whether a cancellation
    /// was issued.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_late_payment(
        &self,
        order_id: OrderId,
        payment_id: PaymentId,
    ) -> Result<bool> {
        let saga = self.load(order_id).await?;
        let ended_without_it = matches!(
            saga.status,
            SagaStatus::Failed | SagaStatus::NoPayment | SagaStatus::Compensating
        ) && saga.payment_id != Some(payment_id);
        if !ended_without_it {
            return Ok(false);
        }

        match self.payments.cancel_payment(payment_id).await {
            Ok(()) => {
                metrics::counter!("late_payments_cancelled_total").increment(1);
                tracing::warn!(%payment_id, status = %saga.status, "cancelled payment that arrived after the saga ended");
                self.announce(CompensationEvent::payment_cancelled(payment_id, order_id))
                    .await;
            }
            Err(e) => {
                tracing::error!(%payment_id, error = %e, "failed to cancel late payment");
            }
        }
        Ok(true)
    }

    /// Charges the order through the circuit breaker and reacts to the answer.
    #[tracing::instrument(skip(self))]
    pub async fn request_payment(&self, order_id: OrderId) -> Result<PaymentOutcome> {
        let saga = self.load(order_id).await?;
        if saga.status != SagaStatus::Waiting {
            tracing::debug!(status = %saga.status, "payment request skipped");
            return Ok(PaymentOutcome::Skipped(saga.status));
        }

        let order = self
            .store
            .find_order(order_id)
            .await?
            .ok_or(SagaError::NotFound(order_id))?;

        let payments = self.payments.clone();
        let result = self
            .breaker
            .call(|| async move {
                match payments.create_payment(order_id, order.amount).await {
                    Ok(receipt) => Ok(Ok(receipt)),
                    // Business rejections must not trip the breaker.
                    Err(PaymentClientError::Declined(reason)) => Ok(Err(reason)),
                    Err(e) => Err(e),
                }
            })
            .await;

        let outcome = match result {
            Ok(Ok(receipt)) => match self.process_payment(order_id, receipt.id).await {
                Err(e) if e.is_superseded() => {
                    self.cancel_late_payment(order_id, receipt.id).await?;
                    Err(e)
                }
                other => other.map(PaymentOutcome::Accepted),
            },
            Ok(Err(reason)) => {
                tracing::info!(%reason, "payment declined");
                return Ok(PaymentOutcome::Declined(reason));
            }
            Err(e) => {
                let reason = match &e {
                    CircuitError::Open(_) => "Payment service circuit open".to_string(),
                    CircuitError::Timeout { .. } => "Payment service timed out".to_string(),
                    CircuitError::Inner(inner) => inner.to_string(),
                };
                tracing::warn!(error = %e, "payment service unavailable, compensating");
                self.compensate(&saga, &reason)
                    .await
                    .map(PaymentOutcome::Compensated)
            }
        };

        match outcome {
            Err(e) if e.is_superseded() => {
                let current = self.load(order_id).await?;
                tracing::debug!(status = %current.status, "saga moved on during payment request");
                Ok(PaymentOutcome::Skipped(current.status))
            }
            other => other,
        }
    }

    /// Current saga for the order, if any.
    pub async fn get_saga_state(&self, order_id: OrderId) -> Result<Option<SagaState>> {
        Ok(self.store.find_saga_by_order(order_id).await?)
    }

    pub async fn find_saga(&self, saga_id: SagaId) -> Result<Option<SagaState>> {
        Ok(self.store.find_saga(saga_id).await?)
    }

    /// Audit trail of a saga, oldest first.
    pub async fn saga_events(&self, saga_id: SagaId) -> Result<Vec<SagaEvent>> {
        Ok(self.store.events_for_saga(saga_id).await?)
    }

    async fn load(&self, order_id: OrderId) -> Result<SagaState> {
        self.store
            .find_saga_by_order(order_id)
            .await?
            .ok_or(SagaError::NotFound(order_id))
    }

    /// Reads the saga, lets `plan` decide the transition and writes it.
    ///
    /// `plan` returning `None` means there is nothing to do. On a version
    /// conflict the saga is re-read and `plan` evaluated again.
    async fn apply<F>(&self, order_id: OrderId, plan: F) -> Result<SagaState>
    where
        F: Fn(&SagaState, DateTime<Utc>) -> Result<Option<SagaTransition>>,
    {
        let attempts = self.config.max_conflict_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let saga = self.load(order_id).await?;
            let Some(transition) = plan(&saga, Utc::now())? else {
                return Ok(saga);
            };

            match self.store.save_transition(transition).await {
                Ok(saved) => {
                    metrics::counter!("saga_transitions_total", "to" => saved.status.as_str())
                        .increment(1);
                    tracing::info!(
                        saga_id = %saved.saga_id,
                        from = %saga.status,
                        to = %saved.status,
                        "saga transitioned"
                    );
                    return Ok(saved);
                }
                Err(StoreError::ConcurrencyConflict { .. }) if attempt < attempts => {
                    tracing::debug!(attempt, "saga changed concurrently, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Publishes a compensation event. Returns whether it went out.
    async fn announce(&self, event: CompensationEvent) -> bool {
        match self.publisher.publish(&event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to publish compensation event");
                false
            }
        }
    }
}

/// Moves a saga copy to `next`, mapping a forbidden move to `InvalidTransition`.
fn advance(
    saga: &SagaState,
    next: SagaStatus,
    step: SagaStep,
    now: DateTime<Utc>,
) -> Result<SagaState> {
    saga.transitioned(next, step, now)
        .map_err(|_| SagaError::InvalidTransition {
            order_id: saga.order_id,
            from: saga.status,
            to: next,
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::services::payment::{InMemoryPaymentClient, PaymentBehavior};
    use common::Money;
    use domain::{NewOrder, SagaEventType};
    use messaging::{InMemoryMessageBus, PublisherConfig, topics};
    use store::InMemoryStore;

    struct Fixture {
        store: InMemoryStore,
        bus: InMemoryMessageBus,
        payments: InMemoryPaymentClient,
        orchestrator: SagaOrchestrator<InMemoryStore>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let bus = InMemoryMessageBus::new();
        let payments = InMemoryPaymentClient::new();
        let orchestrator = SagaOrchestrator::new(
            store.clone(),
            Arc::new(payments.clone()),
            Arc::new(CircuitBreaker::new("payment", CircuitBreakerConfig::default())),
            EventPublisher::new(Arc::new(bus.clone()), PublisherConfig::default()),
            SagaConfig::default(),
        );
        Fixture {
            store,
            bus,
            payments,
            orchestrator,
        }
    }

    async fn started(f: &Fixture, amount: Money) -> SagaState {
        let order = f
            .store
            .insert_order(NewOrder::new("cust-1", "prod-1", 1, amount))
            .await
            .unwrap();
        f.orchestrator
            .start_saga_with_id(SagaId::new(), &order)
            .await
            .unwrap()
    }

    async fn event_types(f: &Fixture, saga_id: SagaId) -> Vec<SagaEventType> {
        f.orchestrator
            .saga_events(saga_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_start_saga_initial_state() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;

        let state = f
            .orchestrator
            .get_saga_state(saga.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SagaStatus::Waiting);
        assert_eq!(state.current_step, SagaStep::OrderCreated);
        assert_eq!(state.payment_id, None);
        assert_eq!(event_types(&f, saga.saga_id).await, vec![SagaEventType::SagaStarted]);
    }

    #[tokio::test]
    async fn test_second_saga_for_order_is_rejected() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        let order = f.store.find_order(saga.order_id).await.unwrap().unwrap();

        let result = f.orchestrator.start_saga(&order).await;
        assert!(matches!(result, Err(SagaError::AlreadyStarted(_))));
    }

    #[tokio::test]
    async fn test_process_then_complete() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;

        let processing = f
            .orchestrator
            .process_payment(saga.order_id, PaymentId::new(5))
            .await
            .unwrap();
        assert_eq!(processing.status, SagaStatus::Processing);
        assert_eq!(processing.payment_id, Some(PaymentId::new(5)));

        let done = f.orchestrator.complete_saga(saga.order_id).await.unwrap();
        assert_eq!(done.status, SagaStatus::Completed);

        let order = f.store.find_order(saga.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(
            event_types(&f, saga.saga_id).await,
            vec![
                SagaEventType::SagaStarted,
                SagaEventType::PaymentProcessing,
                SagaEventType::SagaCompleted
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_process_payment_is_a_noop() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;

        f.orchestrator
            .process_payment(saga.order_id, PaymentId::new(5))
            .await
            .unwrap();
        let again = f
            .orchestrator
            .process_payment(saga.order_id, PaymentId::new(5))
            .await
            .unwrap();

        assert_eq!(again.status, SagaStatus::Processing);
        assert_eq!(event_types(&f, saga.saga_id).await.len(), 2);

        let other = f
            .orchestrator
            .process_payment(saga.order_id, PaymentId::new(6))
            .await;
        assert!(matches!(other, Err(SagaError::PaymentAlreadyAttached { .. })));
    }

    #[tokio::test]
    async fn test_process_payment_for_unknown_order() {
        let f = fixture();
        let result = f
            .orchestrator
            .process_payment(OrderId::new(404), PaymentId::new(1))
            .await;
        assert!(matches!(result, Err(SagaError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_terminal_saga_rejects_transitions() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        f.orchestrator.fail_saga(saga.order_id, "declined").await.unwrap();

        let result = f.orchestrator.complete_saga(saga.order_id).await;
        match result {
            Err(SagaError::InvalidTransition { from, to, .. }) => {
                assert_eq!(from, SagaStatus::Failed);
                assert_eq!(to, SagaStatus::Completed);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_time_out_waiting_saga() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;

        let timed_out = f.orchestrator.time_out(&saga).await.unwrap();
        assert_eq!(timed_out.status, SagaStatus::NoPayment);
        assert_eq!(timed_out.current_step, SagaStep::Timeout);

        let order = f.store.find_order(saga.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert!(f.orchestrator.time_out(&saga).await.is_err());
    }

    #[tokio::test]
    async fn test_refund_from_processing() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        f.orchestrator
            .process_payment(saga.order_id, PaymentId::new(1))
            .await
            .unwrap();

        let refunded = f.orchestrator.refund_payment(saga.order_id).await.unwrap();
        assert_eq!(refunded.status, SagaStatus::Refunded);
        let order = f.store.find_order(saga.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
    }

    #[tokio::test]
    async fn test_compensate_with_payment_cancels_it() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;

        let outcome = f.orchestrator.request_payment(saga.order_id).await.unwrap();
        let PaymentOutcome::Accepted(processing) = outcome else {
            panic!("expected Accepted, got {outcome:?}");
        };
        let payment_id = processing.payment_id.unwrap();

        let failed = f
            .orchestrator
            .compensate(&processing, "payment service unavailable")
            .await
            .unwrap();

        assert_eq!(failed.status, SagaStatus::Failed);
        assert_eq!(failed.current_step, SagaStep::Compensated);
        assert!(f.payments.is_cancelled(payment_id).await);

        let compensation = f.bus.published(topics::COMPENSATION_EVENTS).await;
        assert_eq!(compensation.len(), 2);
        assert!(compensation[0].payload.contains("PaymentCancelled"));
        assert!(compensation[1].payload.contains("OrderCancelled"));

        let order = f.store.find_order(saga.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);

        let events = f.orchestrator.saga_events(saga.saga_id).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, SagaEventType::CompensationCompleted);
        assert_eq!(last.event_data["paymentCancelled"], true);
    }

    #[tokio::test]
    async fn test_compensate_without_payment_only_cancels_order() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;

        f.orchestrator.compensate(&saga, "timeout").await.unwrap();

        let compensation = f.bus.published(topics::COMPENSATION_EVENTS).await;
        assert_eq!(compensation.len(), 1);
        assert!(compensation[0].payload.contains("OrderCancelled"));
        assert_eq!(
            event_types(&f, saga.saga_id).await,
            vec![
                SagaEventType::SagaStarted,
                SagaEventType::CompensationStarted,
                SagaEventType::CompensationCompleted
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_failure_does_not_block_compensation() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        f.orchestrator.request_payment(saga.order_id).await.unwrap();
        f.payments.set_fail_on_cancel(true).await;

        let processing = f.orchestrator.get_saga_state(saga.order_id).await.unwrap().unwrap();
        let failed = f.orchestrator.compensate(&processing, "test").await.unwrap();

        assert_eq!(failed.status, SagaStatus::Failed);
        let events = f.orchestrator.saga_events(saga.saga_id).await.unwrap();
        assert_eq!(events.last().unwrap().event_data["paymentCancelled"], false);
    }

    #[tokio::test]
    async fn test_interrupted_compensation_resumes() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        let compensating = saga
            .transitioned(SagaStatus::Compensating, SagaStep::Compensating, Utc::now())
            .unwrap();
        f.store.put_saga(compensating.clone()).await;

        let failed = f
            .orchestrator
            .resume_compensation(&compensating, "resume")
            .await
            .unwrap();

        assert_eq!(failed.status, SagaStatus::Failed);
        let types = event_types(&f, saga.saga_id).await;
        assert!(!types.contains(&SagaEventType::CompensationStarted));
        assert_eq!(types.last(), Some(&SagaEventType::CompensationCompleted));
    }

    #[tokio::test]
    async fn test_compensation_in_flight_is_not_joined() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        let compensating = saga
            .transitioned(SagaStatus::Compensating, SagaStep::Compensating, Utc::now())
            .unwrap();
        f.store.put_saga(compensating).await;

        let result = f.orchestrator.compensate(&saga, "second trigger").await;

        assert!(matches!(result, Err(SagaError::CompensationInProgress(_))));
        assert!(result.unwrap_err().is_superseded());
        assert!(f.bus.published(topics::COMPENSATION_EVENTS).await.is_empty());
        let state = f.orchestrator.get_saga_state(saga.order_id).await.unwrap().unwrap();
        assert_eq!(state.status, SagaStatus::Compensating);
    }

    #[tokio::test]
    async fn test_racing_compensations_run_side_effects_once() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        f.orchestrator.request_payment(saga.order_id).await.unwrap();
        let processing = f.orchestrator.get_saga_state(saga.order_id).await.unwrap().unwrap();
        f.payments.set_cancel_delay(Duration::from_millis(50)).await;

        let (first, second) = tokio::join!(
            f.orchestrator.compensate(&processing, "timed out"),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                f.orchestrator.compensate(&processing, "payment failed").await
            }
        );

        assert_eq!(first.unwrap().status, SagaStatus::Failed);
        assert!(matches!(second, Err(SagaError::CompensationInProgress(_))));
        assert_eq!(f.payments.cancel_calls().await, 1);

        let compensation = f.bus.published(topics::COMPENSATION_EVENTS).await;
        assert_eq!(compensation.len(), 2);
        let types = event_types(&f, saga.saga_id).await;
        let completions = types
            .iter()
            .filter(|t| **t == SagaEventType::CompensationCompleted)
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_compensating_a_finished_saga_is_rejected() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        f.orchestrator.compensate(&saga, "first").await.unwrap();

        let again = f.orchestrator.compensate(&saga, "second").await;

        assert!(matches!(
            again,
            Err(SagaError::InvalidTransition {
                from: SagaStatus::Failed,
                to: SagaStatus::Compensating,
                ..
            })
        ));
        assert_eq!(f.bus.published(topics::COMPENSATION_EVENTS).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payment_finishing_after_timeout_compensation_is_cancelled() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        f.payments.set_behavior(PaymentBehavior::Hang).await;

        let outcome = f.orchestrator.request_payment(saga.order_id).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Compensated(_)));

        // The remote charge completes after the call already timed out.
        f.payments.set_behavior(PaymentBehavior::Accept).await;
        let late = f
            .payments
            .create_payment(saga.order_id, Money::from_dollars(50))
            .await
            .unwrap();

        let cancelled = f
            .orchestrator
            .cancel_late_payment(saga.order_id, late.id)
            .await
            .unwrap();

        assert!(cancelled);
        assert!(f.payments.is_cancelled(late.id).await);
        let compensation = f.bus.published(topics::COMPENSATION_EVENTS).await;
        assert_eq!(compensation.len(), 2);
        assert!(compensation[1].payload.contains("PaymentCancelled"));
    }

    #[tokio::test]
    async fn test_attached_payment_is_not_cancelled_as_late() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        let PaymentOutcome::Accepted(processing) =
            f.orchestrator.request_payment(saga.order_id).await.unwrap()
        else {
            panic!("expected Accepted");
        };
        let payment_id = processing.payment_id.unwrap();

        assert!(
            !f.orchestrator
                .cancel_late_payment(saga.order_id, payment_id)
                .await
                .unwrap()
        );
        f.orchestrator.complete_saga(saga.order_id).await.unwrap();
        assert!(
            !f.orchestrator
                .cancel_late_payment(saga.order_id, payment_id)
                .await
                .unwrap()
        );
        assert_eq!(f.payments.cancel_calls().await, 0);
    }

    #[tokio::test]
    async fn test_declined_payment_leaves_saga_waiting() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(5)).await;
        f.payments.set_behavior(PaymentBehavior::Decline).await;

        let outcome = f.orchestrator.request_payment(saga.order_id).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Declined(_)));

        let state = f.orchestrator.get_saga_state(saga.order_id).await.unwrap().unwrap();
        assert_eq!(state.status, SagaStatus::Waiting);
    }

    #[tokio::test]
    async fn test_unavailable_payment_compensates() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        f.payments.set_behavior(PaymentBehavior::Unavailable).await;

        let outcome = f.orchestrator.request_payment(saga.order_id).await.unwrap();
        let PaymentOutcome::Compensated(state) = outcome else {
            panic!("expected Compensated, got {outcome:?}");
        };
        assert_eq!(state.status, SagaStatus::Failed);
    }

    #[tokio::test]
    async fn test_request_payment_skips_non_waiting_saga() {
        let f = fixture();
        let saga = started(&f, Money::from_dollars(50)).await;
        f.orchestrator.time_out(&saga).await.unwrap();

        let outcome = f.orchestrator.request_payment(saga.order_id).await.unwrap();
        assert_eq!(outcome, PaymentOutcome::Skipped(SagaStatus::NoPayment));
        assert_eq!(f.payments.create_calls().await, 0);
    }
}
