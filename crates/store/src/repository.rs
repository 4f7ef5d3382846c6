use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, IdempotencyKey, OrderId, PaymentId, SagaId};
use domain::{
    NewOrder, NewPayment, NewSagaEvent, Order, OrderStatus, Payment, PaymentStatus, SagaEvent,
    SagaState, SagaStatus,
};
use serde::{Deserialize, Serialize};

use crate::{Result, SagaQuery};

/// One saga transition, written atomically.
///
/// `saga.version` must be the version that was read; the store rejects the
/// write with `ConcurrencyConflict` if the row has moved on since.
#[derive(Debug, Clone)]
pub struct SagaTransition {
    /// The saga after the transition.
    pub saga: SagaState,
    /// The audit row describing the transition.
    pub event: NewSagaEvent,
    /// The status the saga's order moves to, if any.
    pub order_status: Option<OrderStatus>,
}

/// Orders, keyed by a store-assigned ID.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persists a new order in `Waiting` and returns it with its ID.
    async fn insert_order(&self, order: NewOrder) -> Result<Order>;

    /// Persists the order that belongs to `saga_id`, or returns the order
    /// already stored under that saga ID. Redelivered and concurrent
    /// `OrderCreated` events therefore share one row.
    async fn insert_order_for_saga(&self, saga_id: SagaId, order: NewOrder) -> Result<Order>;

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>>;
}

/// Saga state and its append-only audit log.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Inserts a new saga together with its first audit row.
    ///
    /// Fails with `UniqueViolation` if the order already has a saga.
    async fn insert_saga(&self, saga: &SagaState, event: NewSagaEvent) -> Result<()>;

    async fn find_saga(&self, saga_id: SagaId) -> Result<Option<SagaState>>;

    async fn find_saga_by_order(&self, order_id: OrderId) -> Result<Option<SagaState>>;

    /// Applies a transition: version-checked saga update, optional order
    /// status update and audit append, all or nothing.
    ///
    /// Returns the saga as stored, with its bumped version.
    async fn save_transition(&self, transition: SagaTransition) -> Result<SagaState>;

    async fn find_sagas(&self, query: SagaQuery) -> Result<Vec<SagaState>>;

    /// Counts every saga grouped by status.
    async fn count_by_status(&self) -> Result<HashMap<SagaStatus, u64>>;

    /// Returns the audit trail of a saga, oldest first.
    async fn events_for_saga(&self, saga_id: SagaId) -> Result<Vec<SagaEvent>>;
}

/// Payments, unique per order.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Inserts a payment. Fails with `UniqueViolation` if the order already
    /// has one.
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment>;

    async fn find_payment(&self, id: PaymentId) -> Result<Option<Payment>>;

    async fn find_payment_by_order(&self, order_id: OrderId) -> Result<Option<Payment>>;

    /// Sets the payment status and returns the updated row, or `None` if the
    /// payment does not exist.
    async fn update_payment_status(
        &self,
        id: PaymentId,
        status: PaymentStatus,
    ) -> Result<Option<Payment>>;
}

/// Idempotency keys already handled by a consumer.
#[async_trait]
pub trait ProcessedEventRepository: Send + Sync {
    /// Records the key for the consumer. Returns `false` if it was already
    /// recorded, meaning the event is a duplicate.
    async fn mark_processed(&self, consumer: &str, key: IdempotencyKey) -> Result<bool>;

    /// Returns true if the consumer already recorded the key.
    async fn is_processed(&self, consumer: &str, key: IdempotencyKey) -> Result<bool>;

    /// Forgets keys recorded before `cutoff`. Returns how many were removed.
    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// A gateway request waiting for its asynchronous reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCorrelation {
    pub correlation_id: CorrelationId,
    pub saga_id: SagaId,
    pub expires_at: DateTime<Utc>,
    pub order_id: Option<OrderId>,
    pub status: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PendingCorrelation {
    pub fn new(correlation_id: CorrelationId, saga_id: SagaId, expires_at: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            saga_id,
            expires_at,
            order_id: None,
            status: None,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Durable, TTL-bounded record of pending request/reply correlations.
#[async_trait]
pub trait CorrelationRepository: Send + Sync {
    async fn register_correlation(&self, pending: PendingCorrelation) -> Result<()>;

    /// Stores the reply. Returns `false` if the correlation is unknown or
    /// already expired and purged.
    async fn complete_correlation(
        &self,
        correlation_id: CorrelationId,
        order_id: OrderId,
        status: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn find_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<PendingCorrelation>>;

    /// Deletes correlations whose TTL elapsed before `now`. Returns the count.
    async fn purge_expired_correlations(&self, now: DateTime<Utc>) -> Result<u64>;
}
