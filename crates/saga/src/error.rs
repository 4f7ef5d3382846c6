//! Saga error types.

use common::{OrderId, PaymentId};
use domain::SagaStatus;
use messaging::MessagingError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga exists for the order.
    #[error("Saga not found for order {0}")]
    NotFound(OrderId),

    /// The transition table forbids the move.
    #[error("Invalid saga transition for order {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: SagaStatus,
        to: SagaStatus,
    },

    /// The order already has a saga.
    #[error("Saga already started for order {0}")]
    AlreadyStarted(OrderId),

    /// A different payment is already attached to the saga.
    #[error("Order {order_id} already has payment {existing}, refusing {requested}")]
    PaymentAlreadyAttached {
        order_id: OrderId,
        existing: PaymentId,
        requested: PaymentId,
    },

    /// Another caller is already running this saga's compensation.
    #[error("Compensation already in progress for order {0}")]
    CompensationInProgress(OrderId),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Messaging error.
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),
}

impl SagaError {
    /// True when another trigger already moved the saga on, so the caller
    /// lost a benign race rather than hitting a real failure.
    pub fn is_superseded(&self) -> bool {
        matches!(
            self,
            SagaError::InvalidTransition { .. }
                | SagaError::CompensationInProgress(_)
                | SagaError::Store(StoreError::ConcurrencyConflict { .. })
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
