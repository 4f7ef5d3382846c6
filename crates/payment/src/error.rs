use common::{OrderId, PaymentId};
use store::StoreError;
use thiserror::Error;

/// Errors returned by the payment processor.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// A business rule rejected the payment. Not retried.
    #[error("Payment for order {order_id} declined: {reason}")]
    Declined { order_id: OrderId, reason: String },

    /// Storage kept failing after every retry.
    #[error("Payment for order {order_id} unavailable after {attempts} attempts: {reason}")]
    Unavailable {
        order_id: OrderId,
        attempts: u32,
        reason: String,
    },

    #[error("Payment not found: {0}")]
    NotFound(PaymentId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl PaymentError {
    /// True when the caller should treat the dependency as down.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PaymentError::Unavailable { .. } | PaymentError::Store(_))
    }
}

/// Result type for payment operations.
pub type Result<T> = std::result::Result<T, PaymentError>;
