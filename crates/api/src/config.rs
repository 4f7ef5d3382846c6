//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use messaging::PublisherConfig;
use saga::SagaConfig;

/// Process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `json` for JSON log lines, anything else for text
/// - `DATABASE_URL` — PostgreSQL URL; the in-memory store is used when unset
/// - `SAGA_TIMEOUT_SECS` (60), `TIMEOUT_SCAN_INTERVAL_SECS` (5),
///   `METRICS_INTERVAL_SECS` (10), `RECOVERY_GRACE_SECS` (60)
/// - `PUBLISH_BACKOFF_MS` (1000), `RESPONSE_TIMEOUT_MS` (5000)
/// - `PROCESSED_EVENT_RETENTION_SECS` (86400) and
///   `PROCESSED_EVENT_SWEEP_INTERVAL_SECS` (300)
/// - `KAFKA_BROKERS` — broker list; only read when built with `kafka`
/// - `KAFKA_GROUP_ID` — consumer group (default: `"order-saga"`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub saga_timeout: Duration,
    pub timeout_scan_interval: Duration,
    pub metrics_interval: Duration,
    pub recovery_grace: Duration,
    /// How long deduplication keys are kept.
    pub processed_event_retention: Duration,
    pub processed_event_sweep_interval: Duration,
    pub publish_backoff: Duration,
    /// How long `POST /orders` waits for the order service's reply.
    pub response_timeout: Duration,
    pub kafka_brokers: Option<String>,
    pub kafka_group_id: String,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT").unwrap_or(defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: std::env::var("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(defaults.log_json),
            database_url: std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()),
            saga_timeout: env_parse("SAGA_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.saga_timeout),
            timeout_scan_interval: env_parse("TIMEOUT_SCAN_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout_scan_interval),
            metrics_interval: env_parse("METRICS_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.metrics_interval),
            recovery_grace: env_parse("RECOVERY_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.recovery_grace),
            processed_event_retention: env_parse("PROCESSED_EVENT_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.processed_event_retention),
            processed_event_sweep_interval: env_parse("PROCESSED_EVENT_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.processed_event_sweep_interval),
            publish_backoff: env_parse("PUBLISH_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.publish_backoff),
            response_timeout: env_parse("RESPONSE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.response_timeout),
            kafka_brokers: std::env::var("KAFKA_BROKERS").ok().filter(|b| !b.is_empty()),
            kafka_group_id: std::env::var("KAFKA_GROUP_ID").unwrap_or(defaults.kafka_group_id),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn saga_config(&self) -> SagaConfig {
        SagaConfig {
            saga_timeout: self.saga_timeout,
            timeout_scan_interval: self.timeout_scan_interval,
            metrics_interval: self.metrics_interval,
            recovery_grace: self.recovery_grace,
            processed_event_retention: self.processed_event_retention,
            processed_event_sweep_interval: self.processed_event_sweep_interval,
            ..SagaConfig::default()
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            backoff: self.publish_backoff,
            ..PublisherConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let saga = SagaConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,
            saga_timeout: saga.saga_timeout,
            timeout_scan_interval: saga.timeout_scan_interval,
            metrics_interval: saga.metrics_interval,
            recovery_grace: saga.recovery_grace,
            processed_event_retention: saga.processed_event_retention,
            processed_event_sweep_interval: saga.processed_event_sweep_interval,
            publish_backoff: PublisherConfig::default().backoff,
            response_timeout: Duration::from_secs(5),
            kafka_brokers: None,
            kafka_group_id: "order-saga".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
