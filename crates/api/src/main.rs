//! Service entry point: gateway, order service and payment service in one
//! process, sharing an in-process message bus, or Kafka when built with the
//! `kafka` feature and `KAFKA_BROKERS` is set.

use std::sync::Arc;

use api::GatewayStore;
use api::config::Config;
use messaging::{InMemoryMessageBus, MessageBus};
use metrics_exporter_prometheus::PrometheusHandle;
use store::{InMemoryStore, PostgresStore};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn message_bus(config: &Config) -> Arc<dyn MessageBus> {
    #[cfg(feature = "kafka")]
    if let Some(brokers) = &config.kafka_brokers {
        let kafka = messaging::KafkaConfig::new(brokers.clone(), config.kafka_group_id.clone());
        let bus = messaging::KafkaMessageBus::connect(kafka).expect("failed to create Kafka client");
        tracing::info!(%brokers, "using Kafka message bus");
        return Arc::new(bus);
    }

    if config.kafka_brokers.is_some() {
        tracing::warn!("KAFKA_BROKERS set but built without the kafka feature");
    }
    tracing::info!("using in-process message bus");
    Arc::new(InMemoryMessageBus::without_log())
}

async fn run<S: GatewayStore>(store: S, config: Config, metrics_handle: PrometheusHandle) {
    let bus = message_bus(&config);
    let addr = config.addr();
    let state = api::build_state(store, bus, config);

    match api::recover(&state).await {
        Ok(report) => tracing::info!(?report, "recovery pass complete"),
        Err(e) => tracing::error!(error = %e, "recovery pass failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = api::start_services(&state, shutdown_rx)
        .await
        .expect("failed to start background services");

    let app = api::create_app(state, metrics_handle);

    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = api::routes::metrics::install_recorder()
        .expect("failed to install Prometheus recorder");

    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresStore::connect(&url, 10)
                .await
                .expect("failed to connect to PostgreSQL");
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL store");
            run(store, config, metrics_handle).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory store");
            run(InMemoryStore::new(), config, metrics_handle).await;
        }
    }
}
