//! HTTP gateway and process wiring for the order saga system.
//!
//! Provides the REST surface over the saga orchestrator, wires the order and
//! payment services to the message bus, and runs the background tasks
//! (listeners, timeout scanner, metrics reporter, correlation and
//! processed-event purges), with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod correlation;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use messaging::{EventPublisher, MessageBus, MessagingError, topics};
use metrics_exporter_prometheus::PrometheusHandle;
use payment::{PaymentConfig, PaymentProcessor};
use saga::{
    CircuitBreaker, CircuitBreakerConfig, EventListener, InProcessPaymentClient, MetricsReporter,
    OrderEventHandler, ProcessedEventSweeper, RecoveryPass, RecoveryReport, SagaOrchestrator,
    SagaStore, TimeoutScanner,
};
use store::{CorrelationRepository, PaymentRepository};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use correlation::{CorrelationRegistry, OrderResponseHandler};

/// How long a correlation row outlives its request.
const CORRELATION_TTL: Duration = Duration::from_secs(300);
const CORRELATION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Persistence needed by the whole process.
pub trait GatewayStore: SagaStore + CorrelationRepository + PaymentRepository {}

impl<T> GatewayStore for T where T: SagaStore + CorrelationRepository + PaymentRepository {}

/// Shared application state accessible from all handlers.
pub struct AppState<S: GatewayStore> {
    pub orchestrator: Arc<SagaOrchestrator<S>>,
    pub payments: Arc<PaymentProcessor>,
    pub publisher: EventPublisher,
    pub correlations: Arc<CorrelationRegistry<S>>,
    /// Guards the gateway's order and payment reads.
    pub read_breaker: Arc<CircuitBreaker>,
    pub bus: Arc<dyn MessageBus>,
    pub config: Config,
}

/// Builds the services on top of `store` and `bus`.
pub fn build_state<S: GatewayStore>(
    store: S,
    bus: Arc<dyn MessageBus>,
    config: Config,
) -> Arc<AppState<S>> {
    let publisher = EventPublisher::new(bus.clone(), config.publisher_config());

    let payments = Arc::new(PaymentProcessor::new(
        Arc::new(store.clone()),
        publisher.clone(),
        PaymentConfig::default(),
    ));

    let orchestrator = Arc::new(SagaOrchestrator::new(
        store.clone(),
        Arc::new(InProcessPaymentClient::new(payments.clone())),
        Arc::new(CircuitBreaker::new(
            "payment-service",
            CircuitBreakerConfig::default(),
        )),
        publisher.clone(),
        config.saga_config(),
    ));

    Arc::new(AppState {
        orchestrator,
        payments,
        publisher,
        correlations: Arc::new(CorrelationRegistry::new(store, CORRELATION_TTL)),
        read_breaker: Arc::new(CircuitBreaker::new(
            "gateway-reads",
            CircuitBreakerConfig::default(),
        )),
        bus,
        config,
    })
}

/// Compensates sagas left mid-flight by a previous process.
pub async fn recover<S: GatewayStore>(state: &AppState<S>) -> saga::Result<RecoveryReport> {
    RecoveryPass::new(state.orchestrator.clone()).run().await
}

/// Subscribes the listeners and starts the periodic tasks. All of them stop
/// when `shutdown` flips.
pub async fn start_services<S: GatewayStore>(
    state: &AppState<S>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, MessagingError> {
    let order_handler = Arc::new(OrderEventHandler::new(state.orchestrator.clone()));
    let response_handler = Arc::new(OrderResponseHandler::new(state.correlations.clone()));

    let mut tasks = Vec::new();

    for topic in [topics::ORDER_EVENTS, topics::PAYMENT_EVENTS] {
        let subscription = state.bus.subscribe(topic).await?;
        tasks.push(
            EventListener::new(subscription, order_handler.clone(), state.publisher.clone())
                .spawn(shutdown.clone()),
        );
    }

    let subscription = state.bus.subscribe(topics::ORDER_RESPONSE).await?;
    tasks.push(
        EventListener::new(subscription, response_handler, state.publisher.clone())
            .spawn(shutdown.clone()),
    );

    tasks.push(tokio::spawn(
        TimeoutScanner::new(state.orchestrator.clone()).run(shutdown.clone()),
    ));
    tasks.push(tokio::spawn(
        MetricsReporter::new(state.orchestrator.clone()).run(shutdown.clone()),
    ));
    tasks.push(tokio::spawn(
        ProcessedEventSweeper::new(state.orchestrator.clone()).run(shutdown.clone()),
    ));
    tasks.push(tokio::spawn(
        state
            .correlations
            .clone()
            .run_purge(CORRELATION_PURGE_INTERVAL, shutdown),
    ));

    tracing::info!(tasks = tasks.len(), "Background services started");
    Ok(tasks)
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: GatewayStore>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/orders", post(routes::orders::create::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route("/orders/{id}/saga", get(routes::orders::saga::<S>))
        .route("/payments/{id}", get(routes::payments::get::<S>))
        .route("/correlations/{id}", get(routes::correlations::get::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
