//! Periodic purge of old deduplication keys.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use store::ProcessedEventRepository;
use tokio::sync::watch;

use crate::error::Result;
use crate::orchestrator::{SagaOrchestrator, SagaStore};

/// Deletes processed-event keys older than the configured retention.
///
/// Redeliveries arrive within minutes, so a key kept for a day has long
/// stopped guarding anything.
pub struct ProcessedEventSweeper<S: SagaStore> {
    orchestrator: Arc<SagaOrchestrator<S>>,
    retention: Duration,
    interval: Duration,
}

impl<S: SagaStore> ProcessedEventSweeper<S> {
    pub fn new(orchestrator: Arc<SagaOrchestrator<S>>) -> Self {
        let config = orchestrator.config();
        let retention = config.processed_event_retention;
        let interval = config.processed_event_sweep_interval;
        Self {
            orchestrator,
            retention,
            interval,
        }
    }

    /// Removes keys recorded before `now - retention`. Returns how many went.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let removed = self
            .orchestrator
            .store()
            .purge_processed_before(cutoff)
            .await?;
        if removed > 0 {
            metrics::counter!("processed_events_purged_total").increment(removed);
            tracing::info!(removed, %cutoff, "Purged processed event keys");
        }
        Ok(removed)
    }

    /// Sweeps every interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_at(Utc::now()).await {
                        tracing::error!(error = %e, "Processed event sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Processed event sweeper stopped");
    }
}
