use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, IdempotencyKey, Money, OrderId, PaymentId, SagaId};
use domain::{
    NewOrder, NewPayment, NewSagaEvent, Order, OrderStatus, Payment, PaymentStatus, SagaEvent,
    SagaState, SagaStatus, Version,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::memory::{PAYMENT_ORDER_UNIQUE, SAGA_ORDER_UNIQUE};
use crate::repository::{
    CorrelationRepository, OrderRepository, PaymentRepository, PendingCorrelation,
    ProcessedEventRepository, SagaRepository, SagaTransition,
};
use crate::{Result, SagaQuery, StoreError};

const ORDER_COLUMNS: &str =
    "id, customer_id, product_id, quantity, amount_cents, status, created_at, updated_at";
const SAGA_COLUMNS: &str = "saga_id, order_id, status, current_step, payment_id, timeout_at, created_at, updated_at, version";
const PAYMENT_COLUMNS: &str = "id, order_id, amount_cents, status, processed_at";

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let quantity: i32 = row.try_get("quantity")?;
        Ok(Order {
            id: OrderId::new(row.try_get("id")?),
            customer_id: row.try_get("customer_id")?,
            product_id: row.try_get("product_id")?,
            quantity: u32::try_from(quantity)
                .map_err(|_| StoreError::InvalidData(format!("order quantity {quantity}")))?,
            amount: Money::from_cents(row.try_get("amount_cents")?),
            status: row.try_get::<String, _>("status")?.parse()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_saga(row: PgRow) -> Result<SagaState> {
        Ok(SagaState {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            order_id: OrderId::new(row.try_get("order_id")?),
            status: row.try_get::<String, _>("status")?.parse()?,
            current_step: row.try_get::<String, _>("current_step")?.parse()?,
            payment_id: row
                .try_get::<Option<i64>, _>("payment_id")?
                .map(PaymentId::new),
            timeout_at: row.try_get("timeout_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: Version::new(row.try_get("version")?),
        })
    }

    fn row_to_payment(row: PgRow) -> Result<Payment> {
        Ok(Payment {
            id: PaymentId::new(row.try_get("id")?),
            order_id: OrderId::new(row.try_get("order_id")?),
            amount: Money::from_cents(row.try_get("amount_cents")?),
            status: row.try_get::<String, _>("status")?.parse()?,
            processed_at: row.try_get("processed_at")?,
        })
    }

    fn row_to_saga_event(row: PgRow) -> Result<SagaEvent> {
        Ok(SagaEvent {
            id: row.try_get("id")?,
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            event_type: row.try_get::<String, _>("event_type")?.parse()?,
            event_data: row.try_get("event_data")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_correlation(row: PgRow) -> Result<PendingCorrelation> {
        Ok(PendingCorrelation {
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            expires_at: row.try_get("expires_at")?,
            order_id: row.try_get::<Option<i64>, _>("order_id")?.map(OrderId::new),
            status: row.try_get("status")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    /// Maps a unique violation on `constraint` to `UniqueViolation`.
    fn map_unique(e: sqlx::Error, constraint: &str) -> StoreError {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.constraint() == Some(constraint)
        {
            return StoreError::UniqueViolation {
                constraint: constraint.to_string(),
            };
        }
        StoreError::Database(e)
    }
}

#[async_trait]
impl OrderRepository for PostgresStore {
    #[tracing::instrument(skip(self, order), fields(customer_id = %order.customer_id))]
    async fn insert_order(&self, order: NewOrder) -> Result<Order> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO orders (customer_id, product_id, quantity, amount_cents, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(&order.customer_id)
        .bind(&order.product_id)
        .bind(order.quantity as i32)
        .bind(order.amount.cents())
        .bind(OrderStatus::Waiting.as_str())
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_order(row)
    }

    #[tracing::instrument(skip(self, order), fields(%saga_id))]
    async fn insert_order_for_saga(&self, saga_id: SagaId, order: NewOrder) -> Result<Order> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO orders (saga_id, customer_id, product_id, quantity, amount_cents, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (saga_id) DO NOTHING
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(saga_id.as_uuid())
        .bind(&order.customer_id)
        .bind(&order.product_id)
        .bind(order.quantity as i32)
        .bind(order.amount.cents())
        .bind(OrderStatus::Waiting.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Self::row_to_order(row);
        }

        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE saga_id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_order(row)
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_order).transpose()
    }
}

#[async_trait]
impl SagaRepository for PostgresStore {
    #[tracing::instrument(skip(self, saga, event), fields(saga_id = %saga.saga_id))]
    async fn insert_saga(&self, saga: &SagaState, event: NewSagaEvent) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO saga_state (saga_id, order_id, status, current_step, payment_id, timeout_at, created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(saga.saga_id.as_uuid())
        .bind(saga.order_id.as_i64())
        .bind(saga.status.as_str())
        .bind(saga.current_step.as_str())
        .bind(saga.payment_id.map(|id| id.as_i64()))
        .bind(saga.timeout_at)
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .bind(saga.version.as_i64())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            // A duplicate saga ID is the same logical conflict as a duplicate order.
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("saga_state_pkey")
            {
                return StoreError::UniqueViolation {
                    constraint: SAGA_ORDER_UNIQUE.to_string(),
                };
            }
            Self::map_unique(e, SAGA_ORDER_UNIQUE)
        })?;

        sqlx::query(
            "INSERT INTO saga_events (saga_id, event_type, event_data, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(saga.saga_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.event_data)
        .bind(saga.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_saga(&self, saga_id: SagaId) -> Result<Option<SagaState>> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_state WHERE saga_id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn find_saga_by_order(&self, order_id: OrderId) -> Result<Option<SagaState>> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_state WHERE order_id = $1"
        ))
        .bind(order_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    #[tracing::instrument(
        skip(self, transition),
        fields(saga_id = %transition.saga.saga_id, status = %transition.saga.status)
    )]
    async fn save_transition(&self, transition: SagaTransition) -> Result<SagaState> {
        let SagaTransition {
            saga,
            event,
            order_status,
        } = transition;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(&format!(
            r#"
            UPDATE saga_state
            SET status = $3, current_step = $4, payment_id = $5, updated_at = $6, version = version + 1
            WHERE saga_id = $1 AND version = $2
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(saga.saga_id.as_uuid())
        .bind(saga.version.as_i64())
        .bind(saga.status.as_str())
        .bind(saga.current_step.as_str())
        .bind(saga.payment_id.map(|id| id.as_i64()))
        .bind(saga.updated_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = updated else {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM saga_state WHERE saga_id = $1")
                    .bind(saga.saga_id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;

            return match actual {
                Some(actual) => {
                    metrics::counter!("store_concurrency_conflicts_total").increment(1);
                    Err(StoreError::ConcurrencyConflict {
                        saga_id: saga.saga_id,
                        expected: saga.version,
                        actual: Version::new(actual),
                    })
                }
                None => Err(StoreError::NotFound(format!("saga {}", saga.saga_id))),
            };
        };

        let stored = Self::row_to_saga(row)?;

        if let Some(status) = order_status {
            sqlx::query("UPDATE orders SET status = $2, updated_at = $3 WHERE id = $1")
                .bind(saga.order_id.as_i64())
                .bind(status.as_str())
                .bind(saga.updated_at)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO saga_events (saga_id, event_type, event_data, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(saga.saga_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.event_data)
        .bind(saga.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn find_sagas(&self, query: SagaQuery) -> Result<Vec<SagaState>> {
        let mut sql = format!("SELECT {SAGA_COLUMNS} FROM saga_state WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.timed_out_at.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timeout_at <= ${param_count}"));
        }
        if query.updated_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND updated_at < ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(statuses) = query.statuses {
            let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(names);
        }
        if let Some(now) = query.timed_out_at {
            sqlx_query = sqlx_query.bind(now);
        }
        if let Some(cutoff) = query.updated_before {
            sqlx_query = sqlx_query.bind(cutoff);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn count_by_status(&self) -> Result<HashMap<SagaStatus, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM saga_state GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: SagaStatus = row.try_get::<String, _>("status")?.parse()?;
            let total: i64 = row.try_get("total")?;
            counts.insert(status, total as u64);
        }
        Ok(counts)
    }

    async fn events_for_saga(&self, saga_id: SagaId) -> Result<Vec<SagaEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, saga_id, event_type, event_data, status, created_at
            FROM saga_events
            WHERE saga_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga_event).collect()
    }
}

#[async_trait]
impl PaymentRepository for PostgresStore {
    #[tracing::instrument(skip(self, payment), fields(order_id = %payment.order_id))]
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO payments (order_id, amount_cents, status)
            VALUES ($1, $2, $3)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.order_id.as_i64())
        .bind(payment.amount.cents())
        .bind(payment.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::map_unique(e, PAYMENT_ORDER_UNIQUE))?;

        Self::row_to_payment(row)
    }

    async fn find_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn find_payment_by_order(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1"
        ))
        .bind(order_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn update_payment_status(
        &self,
        id: PaymentId,
        status: PaymentStatus,
    ) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "UPDATE payments SET status = $2 WHERE id = $1 RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(id.as_i64())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_payment).transpose()
    }
}

#[async_trait]
impl ProcessedEventRepository for PostgresStore {
    async fn mark_processed(&self, consumer: &str, key: IdempotencyKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (consumer, idempotency_key)
            VALUES ($1, $2)
            ON CONFLICT (consumer, idempotency_key) DO NOTHING
            "#,
        )
        .bind(consumer)
        .bind(key.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn is_processed(&self, consumer: &str, key: IdempotencyKey) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM processed_events WHERE consumer = $1 AND idempotency_key = $2",
        )
        .bind(consumer)
        .bind(key.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CorrelationRepository for PostgresStore {
    async fn register_correlation(&self, pending: PendingCorrelation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_correlations (correlation_id, saga_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (correlation_id) DO UPDATE SET
                saga_id = EXCLUDED.saga_id,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(pending.correlation_id.as_uuid())
        .bind(pending.saga_id.as_uuid())
        .bind(pending.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_correlation(
        &self,
        correlation_id: CorrelationId,
        order_id: OrderId,
        status: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_correlations
            SET order_id = $2, status = $3, completed_at = $4
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id.as_uuid())
        .bind(order_id.as_i64())
        .bind(status)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<PendingCorrelation>> {
        let row = sqlx::query(
            r#"
            SELECT correlation_id, saga_id, expires_at, order_id, status, completed_at
            FROM pending_correlations
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_correlation).transpose()
    }

    async fn purge_expired_correlations(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pending_correlations WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
