//! Periodic detection of sagas past their payment deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use domain::SagaStatus;
use store::{SagaQuery, SagaRepository};
use tokio::sync::watch;

use crate::error::Result;
use crate::orchestrator::{SagaOrchestrator, SagaStore};

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutReport {
    /// `Waiting` sagas moved to `NoPayment`.
    pub timed_out: usize,
    /// `Processing` sagas compensated.
    pub compensated: usize,
    /// Sagas another trigger moved first, or that failed to transition.
    pub skipped: usize,
}

/// Times out `Waiting` sagas and compensates `Processing` ones whose
/// deadline has passed.
pub struct TimeoutScanner<S: SagaStore> {
    orchestrator: Arc<SagaOrchestrator<S>>,
    interval: Duration,
}

impl<S: SagaStore> TimeoutScanner<S> {
    pub fn new(orchestrator: Arc<SagaOrchestrator<S>>) -> Self {
        let interval = orchestrator.config().timeout_scan_interval;
        Self {
            orchestrator,
            interval,
        }
    }

    pub async fn check_timeouts(&self) -> Result<TimeoutReport> {
        self.check_timeouts_at(Utc::now()).await
    }

    /// Scans for sagas whose deadline is at or before `now`.
    #[tracing::instrument(skip(self))]
    pub async fn check_timeouts_at(&self, now: DateTime<Utc>) -> Result<TimeoutReport> {
        let expired = self
            .orchestrator
            .store()
            .find_sagas(
                SagaQuery::new()
                    .statuses(&[SagaStatus::Waiting, SagaStatus::Processing])
                    .timed_out_at(now),
            )
            .await?;

        let mut report = TimeoutReport::default();

        for saga in expired {
            let result = match saga.status {
                SagaStatus::Waiting => self.orchestrator.time_out(&saga).await.map(|_| true),
                SagaStatus::Processing => self
                    .orchestrator
                    .compensate(&saga, "Saga timed out")
                    .await
                    .map(|_| false),
                _ => continue,
            };

            match result {
                Ok(true) => report.timed_out += 1,
                Ok(false) => report.compensated += 1,
                Err(e) if e.is_superseded() => {
                    tracing::debug!(order_id = %saga.order_id, "Saga moved on before timeout");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(order_id = %saga.order_id, error = %e, "Failed to time out saga");
                    report.skipped += 1;
                }
            }
        }

        if report.timed_out + report.compensated > 0 {
            tracing::info!(
                timed_out = report.timed_out,
                compensated = report.compensated,
                "Timeout scan finished"
            );
        }
        Ok(report)
    }

    /// Scans every interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_timeouts().await {
                        tracing::error!(error = %e, "Timeout scan failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Timeout scanner stopped");
    }
}
