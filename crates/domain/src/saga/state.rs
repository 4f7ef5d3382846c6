//! Persistent saga state.

use chrono::{DateTime, Duration, Utc};
use common::{OrderId, PaymentId, SagaId};
use serde::{Deserialize, Serialize};

use super::status::SagaStatus;
use crate::error::DomainError;
use crate::version::Version;

/// The step a saga last reached. Informational; `SagaStatus` drives decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStep {
    OrderCreated,
    PaymentProcessing,
    PaymentCompleted,
    PaymentFailed,
    PaymentRefunded,
    Compensating,
    Compensated,
    Timeout,
}

impl SagaStep {
    const ALL: [SagaStep; 8] = [
        SagaStep::OrderCreated,
        SagaStep::PaymentProcessing,
        SagaStep::PaymentCompleted,
        SagaStep::PaymentFailed,
        SagaStep::PaymentRefunded,
        SagaStep::Compensating,
        SagaStep::Compensated,
        SagaStep::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::OrderCreated => "ORDER_CREATED",
            SagaStep::PaymentProcessing => "PAYMENT_PROCESSING",
            SagaStep::PaymentCompleted => "PAYMENT_COMPLETED",
            SagaStep::PaymentFailed => "PAYMENT_FAILED",
            SagaStep::PaymentRefunded => "PAYMENT_REFUNDED",
            SagaStep::Compensating => "COMPENSATING",
            SagaStep::Compensated => "COMPENSATED",
            SagaStep::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStep {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStep::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus {
                kind: "saga step",
                value: s.to_string(),
            })
    }
}

/// The persisted state of one saga. Exactly one exists per order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaState {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub status: SagaStatus,
    pub current_step: SagaStep,
    pub payment_id: Option<PaymentId>,
    pub timeout_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: Version,
}

impl SagaState {
    /// Creates a saga in `Waiting` that times out `timeout` after `now`.
    pub fn start(saga_id: SagaId, order_id: OrderId, timeout: Duration, now: DateTime<Utc>) -> Self {
        Self {
            saga_id,
            order_id,
            status: SagaStatus::Waiting,
            current_step: SagaStep::OrderCreated,
            payment_id: None,
            timeout_at: now + timeout,
            created_at: now,
            updated_at: now,
            version: Version::first(),
        }
    }

    /// Returns a copy moved to `next`, or an error if the table forbids it.
    ///
    /// The version is left untouched: it still names the row that was read,
    /// which is what the store compares against before writing.
    pub fn transitioned(
        &self,
        next: SagaStatus,
        step: SagaStep,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let status = self.status.transition_to(next)?;
        Ok(Self {
            status,
            current_step: step,
            updated_at: now,
            ..self.clone()
        })
    }

    /// Returns true if the saga's deadline is at or before `now`.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at <= now
    }

    /// Returns true if the saga has not been touched since before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.updated_at < cutoff
    }
}
