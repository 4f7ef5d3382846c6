//! Order/payment saga orchestration.
//!
//! This crate coordinates the order workflow across the order and payment
//! services without a distributed transaction:
//! 1. `OrderCreated` persists the order and starts a saga in `Waiting`
//! 2. Payment is requested synchronously through a circuit breaker
//! 3. Payment events complete, fail, refund or compensate the saga
//!
//! Sagas that miss their deadline are timed out or compensated by the
//! [`TimeoutScanner`]; sagas stranded by a crash are compensated by the
//! [`RecoveryPass`] at startup. Old deduplication keys are dropped by the
//! [`ProcessedEventSweeper`].

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod listener;
pub mod orchestrator;
pub mod recovery;
pub mod reporter;
pub mod retention;
pub mod services;
pub mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};
pub use config::SagaConfig;
pub use error::{Result, SagaError};
pub use handlers::{ORDER_SERVICE, OrderEventHandler};
pub use listener::{EventListener, MessageHandler};
pub use orchestrator::{PaymentOutcome, SagaOrchestrator, SagaStore};
pub use recovery::{RecoveryPass, RecoveryReport};
pub use reporter::{MetricsReporter, SagaMetricsSnapshot};
pub use retention::ProcessedEventSweeper;
pub use services::{
    InMemoryPaymentClient, InProcessPaymentClient, PaymentBehavior, PaymentClient,
    PaymentClientError, PaymentReceipt,
};
pub use timeout::{TimeoutReport, TimeoutScanner};
