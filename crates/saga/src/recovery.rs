//! Startup pass compensating sagas stranded by a restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use domain::SagaStatus;
use store::{SagaQuery, SagaRepository};

use crate::error::Result;
use crate::orchestrator::{SagaOrchestrator, SagaStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub compensated: usize,
    pub failed: usize,
}

/// Compensates `Processing` and `Compensating` sagas that have not been
/// touched within the grace period.
pub struct RecoveryPass<S: SagaStore> {
    orchestrator: Arc<SagaOrchestrator<S>>,
}

impl<S: SagaStore> RecoveryPass<S> {
    pub fn new(orchestrator: Arc<SagaOrchestrator<S>>) -> Self {
        Self { orchestrator }
    }

    pub async fn run(&self) -> Result<RecoveryReport> {
        self.run_at(Utc::now()).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let grace = chrono::Duration::from_std(self.orchestrator.config().recovery_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let stranded = self
            .orchestrator
            .store()
            .find_sagas(
                SagaQuery::new()
                    .statuses(&[SagaStatus::Processing, SagaStatus::Compensating])
                    .updated_before(now - grace),
            )
            .await?;

        let mut report = RecoveryReport::default();
        for saga in stranded {
            match self
                .orchestrator
                .resume_compensation(&saga, "Recovered after restart")
                .await
            {
                Ok(_) => report.compensated += 1,
                Err(e) if e.is_superseded() => {}
                Err(e) => {
                    tracing::error!(order_id = %saga.order_id, error = %e, "Recovery failed for saga");
                    report.failed += 1;
                }
            }
        }

        metrics::counter!("saga_recovered_total").increment(report.compensated as u64);
        tracing::info!(
            compensated = report.compensated,
            failed = report.failed,
            "Recovery pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::config::SagaConfig;
    use crate::services::payment::InMemoryPaymentClient;
    use common::{Money, PaymentId, SagaId};
    use domain::{NewOrder, SagaState, SagaStep};
    use messaging::{EventPublisher, InMemoryMessageBus, PublisherConfig};
    use store::{InMemoryStore, OrderRepository};

    fn pass(store: &InMemoryStore) -> RecoveryPass<InMemoryStore> {
        let orchestrator = SagaOrchestrator::new(
            store.clone(),
            Arc::new(InMemoryPaymentClient::new()),
            Arc::new(CircuitBreaker::new("payment", CircuitBreakerConfig::default())),
            EventPublisher::new(Arc::new(InMemoryMessageBus::new()), PublisherConfig::default()),
            SagaConfig::default(),
        );
        RecoveryPass::new(Arc::new(orchestrator))
    }

    /// Stages a saga in `status` last touched `age` ago.
    async fn staged(store: &InMemoryStore, status: SagaStatus, age: chrono::Duration) -> SagaState {
        let order = store
            .insert_order(NewOrder::new("c", "p", 1, Money::from_dollars(20)))
            .await
            .unwrap();
        let then = Utc::now() - age;
        let mut saga = SagaState::start(SagaId::new(), order.id, chrono::Duration::hours(1), then);
        saga.status = status;
        saga.current_step = match status {
            SagaStatus::Compensating => SagaStep::Compensating,
            _ => SagaStep::PaymentProcessing,
        };
        saga.payment_id = Some(PaymentId::new(1));
        store.put_saga(saga.clone()).await;
        saga
    }

    #[tokio::test]
    async fn test_stale_sagas_are_compensated() {
        let store = InMemoryStore::new();
        let pass = pass(&store);
        let processing = staged(&store, SagaStatus::Processing, chrono::Duration::minutes(5)).await;
        let compensating =
            staged(&store, SagaStatus::Compensating, chrono::Duration::minutes(5)).await;

        let report = pass.run().await.unwrap();
        assert_eq!(report.compensated, 2);

        for saga in [processing, compensating] {
            let saga = store.find_saga(saga.saga_id).await.unwrap().unwrap();
            assert_eq!(saga.status, SagaStatus::Failed);
        }
    }

    #[tokio::test]
    async fn test_recent_and_waiting_sagas_are_left_alone() {
        let store = InMemoryStore::new();
        let pass = pass(&store);
        let recent = staged(&store, SagaStatus::Processing, chrono::Duration::seconds(5)).await;
        let waiting = staged(&store, SagaStatus::Waiting, chrono::Duration::minutes(5)).await;

        let report = pass.run().await.unwrap();
        assert_eq!(report, RecoveryReport::default());

        assert_eq!(
            store.find_saga(recent.saga_id).await.unwrap().unwrap().status,
            SagaStatus::Processing
        );
        assert_eq!(
            store.find_saga(waiting.saga_id).await.unwrap().unwrap().status,
            SagaStatus::Waiting
        );
    }
}
