//! Saga state machine.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Waiting ──┬──► Processing ──┬──► Completed
///           │                 ├──► Refunded
///           │                 ├──► Failed
///           │                 └──► Compensating ──► Failed
///           ├──► NoPayment
///           ├──► Compensating
///           └──► Failed
/// ```
///
/// Terminal states accept no further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Order created, no payment attempt accepted yet.
    #[default]
    Waiting,

    /// A payment was accepted and is attached to the saga.
    Processing,

    /// Payment succeeded (terminal state).
    Completed,

    /// Payment failed, or compensation finished (terminal state).
    Failed,

    /// Timed out before any payment was accepted (terminal state).
    NoPayment,

    /// Compensating actions are in progress.
    Compensating,

    /// Payment was cancelled externally (terminal state).
    Refunded,
}

impl SagaStatus {
    /// All statuses, in declaration order.
    pub const ALL: [SagaStatus; 7] = [
        SagaStatus::Waiting,
        SagaStatus::Processing,
        SagaStatus::Completed,
        SagaStatus::Failed,
        SagaStatus::NoPayment,
        SagaStatus::Compensating,
        SagaStatus::Refunded,
    ];

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Waiting, Processing | NoPayment | Compensating | Failed)
                | (Processing, Completed | Compensating | Refunded | Failed)
                | (Compensating, Failed)
        )
    }

    /// Validates a transition, returning the new status.
    pub fn transition_to(self, next: SagaStatus) -> Result<SagaStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Returns true if compensation may be started or resumed from here.
    pub fn can_compensate(&self) -> bool {
        matches!(
            self,
            SagaStatus::Waiting | SagaStatus::Processing | SagaStatus::Compensating
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Failed
                | SagaStatus::NoPayment
                | SagaStatus::Refunded
        )
    }

    /// Returns the status name as stored and reported.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Waiting => "WAITING",
            SagaStatus::Processing => "PROCESSING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::NoPayment => "NO_PAYMENT",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Refunded => "REFUNDED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus {
                kind: "saga",
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_waiting() {
        assert_eq!(SagaStatus::default(), SagaStatus::Waiting);
    }

    #[test]
    fn test_waiting_transitions() {
        let waiting = SagaStatus::Waiting;
        assert!(waiting.can_transition_to(SagaStatus::Processing));
        assert!(waiting.can_transition_to(SagaStatus::NoPayment));
        assert!(waiting.can_transition_to(SagaStatus::Compensating));
        assert!(waiting.can_transition_to(SagaStatus::Failed));
        assert!(!waiting.can_transition_to(SagaStatus::Completed));
        assert!(!waiting.can_transition_to(SagaStatus::Refunded));
        assert!(!waiting.can_transition_to(SagaStatus::Waiting));
    }

    #[test]
    fn test_processing_transitions() {
        let processing = SagaStatus::Processing;
        assert!(processing.can_transition_to(SagaStatus::Completed));
        assert!(processing.can_transition_to(SagaStatus::Compensating));
        assert!(processing.can_transition_to(SagaStatus::Refunded));
        assert!(processing.can_transition_to(SagaStatus::Failed));
        assert!(!processing.can_transition_to(SagaStatus::Waiting));
        assert!(!processing.can_transition_to(SagaStatus::NoPayment));
        assert!(!processing.can_transition_to(SagaStatus::Processing));
    }

    #[test]
    fn test_compensating_only_reaches_failed() {
        for next in SagaStatus::ALL {
            assert_eq!(
                SagaStatus::Compensating.can_transition_to(next),
                next == SagaStatus::Failed
            );
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for from in SagaStatus::ALL.into_iter().filter(SagaStatus::is_terminal) {
            for next in SagaStatus::ALL {
                assert!(!from.can_transition_to(next), "{from} -> {next}");
            }
        }
    }

    #[test]
    fn test_transition_to_reports_both_ends() {
        let err = SagaStatus::Completed
            .transition_to(SagaStatus::Failed)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: SagaStatus::Completed,
                to: SagaStatus::Failed
            }
        );
    }

    #[test]
    fn test_display_and_parse() {
        for status in SagaStatus::ALL {
            assert_eq!(status.to_string().parse::<SagaStatus>().unwrap(), status);
        }
        assert_eq!(SagaStatus::NoPayment.to_string(), "NO_PAYMENT");
        assert!("STARTED".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&SagaStatus::NoPayment).unwrap();
        assert_eq!(json, "\"NO_PAYMENT\"");
        let deserialized: SagaStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, SagaStatus::NoPayment);
    }
}
