//! Periodic saga status gauges.

use std::sync::Arc;
use std::time::Duration;

use domain::SagaStatus;
use serde::Serialize;
use store::SagaRepository;
use tokio::sync::watch;

use crate::error::Result;
use crate::orchestrator::{SagaOrchestrator, SagaStore};

/// Saga counts at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaMetricsSnapshot {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub processing: u64,
    /// Completed sagas as a percentage of all sagas; 0 when there are none.
    pub success_rate: f64,
}

/// Publishes saga counts as gauges.
pub struct MetricsReporter<S: SagaStore> {
    orchestrator: Arc<SagaOrchestrator<S>>,
    interval: Duration,
}

impl<S: SagaStore> MetricsReporter<S> {
    pub fn new(orchestrator: Arc<SagaOrchestrator<S>>) -> Self {
        let interval = orchestrator.config().metrics_interval;
        Self {
            orchestrator,
            interval,
        }
    }

    pub async fn snapshot(&self) -> Result<SagaMetricsSnapshot> {
        let counts = self.orchestrator.store().count_by_status().await?;
        let count = |status: SagaStatus| counts.get(&status).copied().unwrap_or(0);

        let total: u64 = counts.values().sum();
        let completed = count(SagaStatus::Completed);
        let success_rate = if total == 0 {
            0.0
        } else {
            completed as f64 * 100.0 / total as f64
        };

        Ok(SagaMetricsSnapshot {
            total,
            completed,
            failed: count(SagaStatus::Failed),
            processing: count(SagaStatus::Processing),
            success_rate,
        })
    }

    /// Takes a snapshot and sets the gauges from it.
    pub async fn report(&self) -> Result<SagaMetricsSnapshot> {
        let snapshot = self.snapshot().await?;

        metrics::gauge!("saga_total").set(snapshot.total as f64);
        metrics::gauge!("saga_completed").set(snapshot.completed as f64);
        metrics::gauge!("saga_failed").set(snapshot.failed as f64);
        metrics::gauge!("saga_processing").set(snapshot.processing as f64);
        metrics::gauge!("saga_success_rate").set(snapshot.success_rate);

        tracing::debug!(?snapshot, "Saga metrics reported");
        Ok(snapshot)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.report().await {
                        tracing::error!(error = %e, "Saga metrics report failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::config::SagaConfig;
    use crate::services::payment::InMemoryPaymentClient;
    use chrono::Utc;
    use common::{OrderId, SagaId};
    use domain::SagaState;
    use messaging::{EventPublisher, InMemoryMessageBus, PublisherConfig};
    use store::InMemoryStore;

    fn reporter(store: &InMemoryStore) -> MetricsReporter<InMemoryStore> {
        let orchestrator = SagaOrchestrator::new(
            store.clone(),
            Arc::new(InMemoryPaymentClient::new()),
            Arc::new(CircuitBreaker::new("payment", CircuitBreakerConfig::default())),
            EventPublisher::new(Arc::new(InMemoryMessageBus::new()), PublisherConfig::default()),
            SagaConfig::default(),
        );
        MetricsReporter::new(Arc::new(orchestrator))
    }

    async fn put(store: &InMemoryStore, order: i64, status: SagaStatus) {
        let mut saga = SagaState::start(
            SagaId::new(),
            OrderId::new(order),
            chrono::Duration::seconds(60),
            Utc::now(),
        );
        saga.status = status;
        store.put_saga(saga).await;
    }

    #[tokio::test]
    async fn test_empty_store_reports_zero() {
        let store = InMemoryStore::new();
        let snapshot = reporter(&store).report().await.unwrap();
        assert_eq!(snapshot, SagaMetricsSnapshot::default());
    }

    #[tokio::test]
    async fn test_snapshot_counts_and_rate() {
        let store = InMemoryStore::new();
        put(&store, 1, SagaStatus::Completed).await;
        put(&store, 2, SagaStatus::Completed).await;
        put(&store, 3, SagaStatus::Completed).await;
        put(&store, 4, SagaStatus::Failed).await;
        put(&store, 5, SagaStatus::Processing).await;
        put(&store, 6, SagaStatus::NoPayment).await;

        let snapshot = reporter(&store).snapshot().await.unwrap();
        assert_eq!(snapshot.total, 6);
        assert_eq!(snapshot.completed, 3);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.processing, 1);
        assert!((snapshot.success_rate - 50.0).abs() < f64::EPSILON);
    }
}
