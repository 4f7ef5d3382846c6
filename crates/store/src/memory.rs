use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, IdempotencyKey, OrderId, PaymentId, SagaId};
use domain::{
    NewOrder, NewPayment, NewSagaEvent, Order, Payment, PaymentStatus, SagaEvent, SagaState,
    SagaStatus,
};
use tokio::sync::RwLock;

use crate::repository::{
    CorrelationRepository, OrderRepository, PaymentRepository, PendingCorrelation,
    ProcessedEventRepository, SagaRepository, SagaTransition,
};
use crate::{Result, SagaQuery, StoreError};

/// Constraint names shared with the PostgreSQL schema.
pub(crate) const SAGA_ORDER_UNIQUE: &str = "saga_state_order_id_key";
pub(crate) const PAYMENT_ORDER_UNIQUE: &str = "payments_order_id_key";

#[derive(Debug, Default)]
struct Tables {
    orders: BTreeMap<OrderId, Order>,
    order_by_saga: HashMap<SagaId, OrderId>,
    payments: BTreeMap<PaymentId, Payment>,
    sagas: HashMap<SagaId, SagaState>,
    saga_by_order: HashMap<OrderId, SagaId>,
    saga_events: Vec<SagaEvent>,
    processed: HashMap<(String, IdempotencyKey), DateTime<Utc>>,
    correlations: HashMap<CorrelationId, PendingCorrelation>,
    next_order_id: i64,
    next_payment_id: i64,
    next_event_id: i64,
    failing_transitions: u32,
}

impl Tables {
    fn next_order_id(&mut self) -> OrderId {
        self.next_order_id += 1;
        OrderId::new(self.next_order_id)
    }

    fn next_payment_id(&mut self) -> PaymentId {
        self.next_payment_id += 1;
        PaymentId::new(self.next_payment_id)
    }

    fn append_event(&mut self, saga_id: SagaId, event: NewSagaEvent, now: DateTime<Utc>) {
        self.next_event_id += 1;
        let row = event.into_event(self.next_event_id, saga_id, now);
        self.saga_events.push(row);
    }
}

/// In-memory store implementation.
///
/// All tables sit behind a single lock, so every multi-row write is atomic
/// in the same way a database transaction is.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of orders stored.
    pub async fn order_count(&self) -> usize {
        self.tables.read().await.orders.len()
    }

    /// Returns the number of payments stored.
    pub async fn payment_count(&self) -> usize {
        self.tables.read().await.payments.len()
    }

    /// Returns the number of audit rows stored across all sagas.
    pub async fn saga_event_count(&self) -> usize {
        self.tables.read().await.saga_events.len()
    }

    /// Makes the next `count` transitions fail with `Unavailable`.
    pub async fn fail_next_transitions(&self, count: u32) {
        self.tables.write().await.failing_transitions = count;
    }

    /// Overwrites a saga row as-is, bypassing the transition checks.
    ///
    /// Used to stage sagas with old timestamps when exercising the scanners.
    pub async fn put_saga(&self, saga: SagaState) {
        let mut tables = self.tables.write().await;
        tables.saga_by_order.insert(saga.order_id, saga.saga_id);
        tables.sagas.insert(saga.saga_id, saga);
    }
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn insert_order(&self, order: NewOrder) -> Result<Order> {
        let mut tables = self.tables.write().await;
        let id = tables.next_order_id();
        let order = order.into_order(id, Utc::now());
        tables.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn insert_order_for_saga(&self, saga_id: SagaId, order: NewOrder) -> Result<Order> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .order_by_saga
            .get(&saga_id)
            .and_then(|id| tables.orders.get(id))
        {
            return Ok(existing.clone());
        }

        let id = tables.next_order_id();
        let order = order.into_order(id, Utc::now());
        tables.orders.insert(id, order.clone());
        tables.order_by_saga.insert(saga_id, id);
        Ok(order)
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }
}

#[async_trait]
impl SagaRepository for InMemoryStore {
    async fn insert_saga(&self, saga: &SagaState, event: NewSagaEvent) -> Result<()> {
        let mut tables = self.tables.write().await;

        if tables.saga_by_order.contains_key(&saga.order_id)
            || tables.sagas.contains_key(&saga.saga_id)
        {
            return Err(StoreError::UniqueViolation {
                constraint: SAGA_ORDER_UNIQUE.to_string(),
            });
        }

        tables.saga_by_order.insert(saga.order_id, saga.saga_id);
        tables.sagas.insert(saga.saga_id, saga.clone());
        tables.append_event(saga.saga_id, event, saga.created_at);
        Ok(())
    }

    async fn find_saga(&self, saga_id: SagaId) -> Result<Option<SagaState>> {
        Ok(self.tables.read().await.sagas.get(&saga_id).cloned())
    }

    async fn find_saga_by_order(&self, order_id: OrderId) -> Result<Option<SagaState>> {
        let tables = self.tables.read().await;
        Ok(tables
            .saga_by_order
            .get(&order_id)
            .and_then(|saga_id| tables.sagas.get(saga_id))
            .cloned())
    }

    async fn save_transition(&self, transition: SagaTransition) -> Result<SagaState> {
        let SagaTransition {
            mut saga,
            event,
            order_status,
        } = transition;

        let mut tables = self.tables.write().await;

        if tables.failing_transitions > 0 {
            tables.failing_transitions -= 1;
            return Err(StoreError::Unavailable(format!(
                "transition of saga {} rejected",
                saga.saga_id
            )));
        }

        let current = tables
            .sagas
            .get(&saga.saga_id)
            .ok_or_else(|| StoreError::NotFound(format!("saga {}", saga.saga_id)))?;

        if current.version != saga.version {
            return Err(StoreError::ConcurrencyConflict {
                saga_id: saga.saga_id,
                expected: saga.version,
                actual: current.version,
            });
        }

        saga.version = saga.version.next();
        tables.sagas.insert(saga.saga_id, saga.clone());

        if let Some(status) = order_status
            && let Some(order) = tables.orders.get_mut(&saga.order_id)
        {
            order.status = status;
            order.updated_at = saga.updated_at;
        }

        tables.append_event(saga.saga_id, event, saga.updated_at);
        Ok(saga)
    }

    async fn find_sagas(&self, query: SagaQuery) -> Result<Vec<SagaState>> {
        let tables = self.tables.read().await;
        let mut sagas: Vec<_> = tables
            .sagas
            .values()
            .filter(|saga| query.matches(saga))
            .cloned()
            .collect();
        sagas.sort_by_key(|saga| saga.created_at);
        if let Some(limit) = query.limit {
            sagas.truncate(limit);
        }
        Ok(sagas)
    }

    async fn count_by_status(&self) -> Result<HashMap<SagaStatus, u64>> {
        let tables = self.tables.read().await;
        let mut counts = HashMap::new();
        for saga in tables.sagas.values() {
            *counts.entry(saga.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn events_for_saga(&self, saga_id: SagaId) -> Result<Vec<SagaEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .saga_events
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment> {
        let mut tables = self.tables.write().await;

        if tables
            .payments
            .values()
            .any(|p| p.order_id == payment.order_id)
        {
            return Err(StoreError::UniqueViolation {
                constraint: PAYMENT_ORDER_UNIQUE.to_string(),
            });
        }

        let id = tables.next_payment_id();
        let payment = payment.into_payment(id, Utc::now());
        tables.payments.insert(id, payment.clone());
        Ok(payment)
    }

    async fn find_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        Ok(self.tables.read().await.payments.get(&id).cloned())
    }

    async fn find_payment_by_order(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .values()
            .find(|p| p.order_id == order_id)
            .cloned())
    }

    async fn update_payment_status(
        &self,
        id: PaymentId,
        status: PaymentStatus,
    ) -> Result<Option<Payment>> {
        let mut tables = self.tables.write().await;
        Ok(tables.payments.get_mut(&id).map(|payment| {
            payment.status = status;
            payment.clone()
        }))
    }
}

#[async_trait]
impl ProcessedEventRepository for InMemoryStore {
    async fn mark_processed(&self, consumer: &str, key: IdempotencyKey) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let entry = (consumer.to_string(), key);
        if tables.processed.contains_key(&entry) {
            return Ok(false);
        }
        tables.processed.insert(entry, Utc::now());
        Ok(true)
    }

    async fn is_processed(&self, consumer: &str, key: IdempotencyKey) -> Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables.processed.contains_key(&(consumer.to_string(), key)))
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.processed.len();
        tables.processed.retain(|_, at| *at >= cutoff);
        Ok((before - tables.processed.len()) as u64)
    }
}

#[async_trait]
impl CorrelationRepository for InMemoryStore {
    async fn register_correlation(&self, pending: PendingCorrelation) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .correlations
            .insert(pending.correlation_id, pending);
        Ok(())
    }

    async fn complete_correlation(
        &self,
        correlation_id: CorrelationId,
        order_id: OrderId,
        status: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.correlations.get_mut(&correlation_id) {
            Some(pending) => {
                pending.order_id = Some(order_id);
                pending.status = Some(status.to_string());
                pending.completed_at = Some(completed_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<PendingCorrelation>> {
        Ok(self
            .tables
            .read()
            .await
            .correlations
            .get(&correlation_id)
            .cloned())
    }

    async fn purge_expired_correlations(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.correlations.len();
        tables.correlations.retain(|_, c| c.expires_at >= now);
        Ok((before - tables.correlations.len()) as u64)
    }
}
