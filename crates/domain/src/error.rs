//! Domain error types.

use thiserror::Error;

use crate::saga::SagaStatus;

/// Errors raised by domain rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// The saga state machine does not allow this transition.
    #[error("Invalid saga transition from {from} to {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },

    /// A stored status string is not part of the closed status set.
    #[error("Unknown {kind} status: {value}")]
    UnknownStatus { kind: &'static str, value: String },
}
