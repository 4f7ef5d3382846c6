//! Persistent stores for the order saga services.
//!
//! Repository traits are implemented twice: [`InMemoryStore`] for tests and
//! single-process runs, and [`PostgresStore`] backed by `sqlx`. Both honour
//! the same guarantees: unique orders per saga and per payment, and an atomic
//! version-checked write of saga state, order status and audit row.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod repository;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use query::SagaQuery;
pub use repository::{
    CorrelationRepository, OrderRepository, PaymentRepository, PendingCorrelation,
    ProcessedEventRepository, SagaRepository, SagaTransition,
};
