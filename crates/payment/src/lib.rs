//! Payment processing for the order saga.
//!
//! [`PaymentProcessor`] creates at most one payment per order. Duplicate
//! requests return the existing payment; concurrent duplicates are settled
//! by the store's uniqueness on the order ID. Every outcome is announced on
//! `payment-events`.

pub mod config;
pub mod error;
pub mod processor;

pub use config::PaymentConfig;
pub use error::{PaymentError, Result};
pub use processor::PaymentProcessor;
