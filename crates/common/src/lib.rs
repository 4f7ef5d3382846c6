//! Shared identifiers and value types used by every service in the workspace.

pub mod money;
pub mod types;

pub use money::{Money, MoneyParseError};
pub use types::{CorrelationId, IdempotencyKey, OrderId, PaymentId, SagaId};
