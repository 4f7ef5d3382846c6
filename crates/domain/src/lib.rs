//! Domain layer for the order saga services.
//!
//! This crate provides the persistent data model shared by the services:
//! - `Order` and its lifecycle status
//! - `Payment`, unique per order
//! - `SagaState` with the closed `SagaStatus` set and its transition table
//! - `SagaEvent`, the append-only audit record written on every transition

pub mod error;
pub mod order;
pub mod payment;
pub mod saga;
pub mod version;

pub use error::DomainError;
pub use order::{NewOrder, Order, OrderStatus};
pub use payment::{NewPayment, Payment, PaymentStatus};
pub use saga::{NewSagaEvent, SagaEvent, SagaEventType, SagaState, SagaStatus, SagaStep};
pub use version::Version;
