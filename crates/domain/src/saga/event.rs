//! Saga audit trail records.

use chrono::{DateTime, Utc};
use common::{Money, OrderId, PaymentId, SagaId};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::DomainError;

/// Status stamped on every audit row.
pub const LOGGED: &str = "LOGGED";

/// Kinds of audit events, one per saga transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaEventType {
    SagaStarted,
    PaymentProcessing,
    SagaCompleted,
    SagaFailed,
    PaymentRefunded,
    SagaTimeout,
    CompensationStarted,
    CompensationCompleted,
}

impl SagaEventType {
    const ALL: [SagaEventType; 8] = [
        SagaEventType::SagaStarted,
        SagaEventType::PaymentProcessing,
        SagaEventType::SagaCompleted,
        SagaEventType::SagaFailed,
        SagaEventType::PaymentRefunded,
        SagaEventType::SagaTimeout,
        SagaEventType::CompensationStarted,
        SagaEventType::CompensationCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaEventType::SagaStarted => "SAGA_STARTED",
            SagaEventType::PaymentProcessing => "PAYMENT_PROCESSING",
            SagaEventType::SagaCompleted => "SAGA_COMPLETED",
            SagaEventType::SagaFailed => "SAGA_FAILED",
            SagaEventType::PaymentRefunded => "PAYMENT_REFUNDED",
            SagaEventType::SagaTimeout => "SAGA_TIMEOUT",
            SagaEventType::CompensationStarted => "COMPENSATION_STARTED",
            SagaEventType::CompensationCompleted => "COMPENSATION_COMPLETED",
        }
    }
}

impl std::fmt::Display for SagaEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaEventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus {
                kind: "saga event",
                value: s.to_string(),
            })
    }
}

/// A stored audit row. Append-only, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaEvent {
    pub id: i64,
    pub saga_id: SagaId,
    pub event_type: SagaEventType,
    pub event_data: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// An audit row about to be appended alongside a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSagaEvent {
    pub event_type: SagaEventType,
    pub event_data: serde_json::Value,
}

// Convenience constructors
impl NewSagaEvent {
    pub fn saga_started(
        order_id: OrderId,
        customer_id: &str,
        product_id: &str,
        quantity: u32,
        amount: Money,
    ) -> Self {
        Self {
            event_type: SagaEventType::SagaStarted,
            event_data: json!({
                "orderId": order_id,
                "customerId": customer_id,
                "productId": product_id,
                "quantity": quantity,
                "amount": amount,
            }),
        }
    }

    pub fn payment_processing(payment_id: PaymentId) -> Self {
        Self {
            event_type: SagaEventType::PaymentProcessing,
            event_data: json!({ "paymentId": payment_id }),
        }
    }

    pub fn saga_completed() -> Self {
        Self {
            event_type: SagaEventType::SagaCompleted,
            event_data: json!({ "message": "Payment completed successfully" }),
        }
    }

    pub fn saga_failed(reason: impl Into<String>) -> Self {
        Self {
            event_type: SagaEventType::SagaFailed,
            event_data: json!({ "reason": reason.into() }),
        }
    }

    pub fn payment_refunded() -> Self {
        Self {
            event_type: SagaEventType::PaymentRefunded,
            event_data: json!({ "message": "Payment cancelled and refunded" }),
        }
    }

    pub fn saga_timeout() -> Self {
        Self {
            event_type: SagaEventType::SagaTimeout,
            event_data: json!({ "message": "No payment received within timeout period" }),
        }
    }

    pub fn compensation_started(order_id: OrderId, reason: impl Into<String>) -> Self {
        Self {
            event_type: SagaEventType::CompensationStarted,
            event_data: json!({ "orderId": order_id, "reason": reason.into() }),
        }
    }

    /// Records which compensating actions went through.
    pub fn compensation_completed(
        payment_id: Option<PaymentId>,
        payment_cancelled: bool,
        order_cancelled: bool,
    ) -> Self {
        Self {
            event_type: SagaEventType::CompensationCompleted,
            event_data: json!({
                "paymentId": payment_id,
                "paymentCancelled": payment_cancelled,
                "orderCancelled": order_cancelled,
            }),
        }
    }

    /// Materializes the row with a store-assigned ID.
    pub fn into_event(self, id: i64, saga_id: SagaId, created_at: DateTime<Utc>) -> SagaEvent {
        SagaEvent {
            id,
            saga_id,
            event_type: self.event_type,
            event_data: self.event_data,
            status: LOGGED.to_string(),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types() {
        assert_eq!(
            NewSagaEvent::payment_processing(PaymentId::new(3)).event_type,
            SagaEventType::PaymentProcessing
        );
        assert_eq!(
            NewSagaEvent::saga_timeout().event_type,
            SagaEventType::SagaTimeout
        );
        assert_eq!(
            NewSagaEvent::compensation_completed(None, false, true).event_type,
            SagaEventType::CompensationCompleted
        );
    }

    #[test]
    fn test_compensation_completed_data() {
        let event = NewSagaEvent::compensation_completed(Some(PaymentId::new(9)), true, true);
        assert_eq!(event.event_data["paymentId"], 9);
        assert_eq!(event.event_data["paymentCancelled"], true);
        assert_eq!(event.event_data["orderCancelled"], true);
    }

    #[test]
    fn test_into_event_is_logged() {
        let saga_id = SagaId::new();
        let event = NewSagaEvent::saga_completed().into_event(1, saga_id, Utc::now());
        assert_eq!(event.status, LOGGED);
        assert_eq!(event.saga_id, saga_id);
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(SagaEventType::SagaTimeout.to_string(), "SAGA_TIMEOUT");
        assert_eq!(
            "COMPENSATION_STARTED".parse::<SagaEventType>().unwrap(),
            SagaEventType::CompensationStarted
        );
    }
}
