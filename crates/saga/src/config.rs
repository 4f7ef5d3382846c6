use std::time::Duration;

/// Orchestrator and background task settings.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// How long a saga may wait for payment before timing out.
    pub saga_timeout: Duration,
    /// Re-reads allowed when a transition loses an optimistic version race.
    pub max_conflict_retries: u32,
    /// Timeout scanner period.
    pub timeout_scan_interval: Duration,
    /// Metrics reporter period.
    pub metrics_interval: Duration,
    /// Sagas untouched for longer than this are compensated at startup.
    pub recovery_grace: Duration,
    /// Deduplication keys older than this are purged.
    pub processed_event_retention: Duration,
    pub processed_event_sweep_interval: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            saga_timeout: Duration::from_secs(60),
            max_conflict_retries: 3,
            timeout_scan_interval: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(10),
            recovery_grace: Duration::from_secs(60),
            processed_event_retention: Duration::from_secs(24 * 60 * 60),
            processed_event_sweep_interval: Duration::from_secs(300),
        }
    }
}
