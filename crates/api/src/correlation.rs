//! Request/reply correlation between `POST /orders` and `order-response`.
//!
//! Each request registers a durable row and an in-process oneshot. The
//! `order-response` listener completes both; a request that gives up removes
//! its waiter and leaves the row for `GET /correlations/{id}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{CorrelationId, SagaId};
use messaging::{Message, OrderResponseMessage, decode};
use saga::MessageHandler;
use store::{CorrelationRepository, PendingCorrelation};
use tokio::sync::{Mutex, oneshot, watch};

/// Service name recorded on dead-lettered `order-response` messages.
pub const GATEWAY_SERVICE: &str = "api-gateway";

pub struct CorrelationRegistry<S: CorrelationRepository> {
    store: S,
    waiters: Mutex<HashMap<CorrelationId, oneshot::Sender<OrderResponseMessage>>>,
    ttl: Duration,
}

impl<S: CorrelationRepository> CorrelationRegistry<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Records a pending request and returns the receiver for its reply.
    pub async fn register(
        &self,
        correlation_id: CorrelationId,
        saga_id: SagaId,
    ) -> store::Result<oneshot::Receiver<OrderResponseMessage>> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        self.store
            .register_correlation(PendingCorrelation::new(
                correlation_id,
                saga_id,
                Utc::now() + ttl,
            ))
            .await?;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(correlation_id, tx);
        Ok(rx)
    }

    /// Drops the waiter of a request that stopped waiting.
    pub async fn forget(&self, correlation_id: CorrelationId) {
        self.waiters.lock().await.remove(&correlation_id);
    }

    pub async fn pending_waiters(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// Stores the reply and wakes the waiting request, if any.
    #[tracing::instrument(skip(self, response), fields(order_id = %response.order_id))]
    pub async fn complete(&self, response: OrderResponseMessage) -> store::Result<()> {
        let Some(correlation_id) = response.correlation_id else {
            tracing::debug!("Order response without correlation ID");
            return Ok(());
        };

        let known = self
            .store
            .complete_correlation(correlation_id, response.order_id, &response.status, Utc::now())
            .await?;
        if !known {
            tracing::debug!(%correlation_id, "Reply for unknown or expired correlation");
        }

        if let Some(waiter) = self.waiters.lock().await.remove(&correlation_id) {
            // The receiver may have timed out in between.
            let _ = waiter.send(response);
        }
        Ok(())
    }

    pub async fn find(&self, correlation_id: CorrelationId) -> store::Result<Option<PendingCorrelation>> {
        self.store.find_correlation(correlation_id).await
    }

    pub async fn purge_expired(&self) -> store::Result<u64> {
        let purged = self.store.purge_expired_correlations(Utc::now()).await?;
        if purged > 0 {
            tracing::debug!(purged, "Expired correlations purged");
        }
        Ok(purged)
    }

    /// Purges expired rows every `interval` until shutdown.
    pub async fn run_purge(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.purge_expired().await {
                        tracing::error!(error = %e, "Correlation purge failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Feeds `order-response` messages into the registry.
pub struct OrderResponseHandler<S: CorrelationRepository> {
    registry: Arc<CorrelationRegistry<S>>,
}

impl<S: CorrelationRepository> OrderResponseHandler<S> {
    pub fn new(registry: Arc<CorrelationRegistry<S>>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl<S: CorrelationRepository + 'static> MessageHandler for OrderResponseHandler<S> {
    fn service(&self) -> &'static str {
        GATEWAY_SERVICE
    }

    async fn handle(&self, message: &Message) -> saga::Result<()> {
        let response: OrderResponseMessage = decode(message)?;
        self.registry.complete(response).await?;
        Ok(())
    }
}
