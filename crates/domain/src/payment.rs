//! Payment record.

use chrono::{DateTime, Utc};
use common::{Money, OrderId, PaymentId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The status of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Completed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(PaymentStatus::Completed),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            other => Err(DomainError::UnknownStatus {
                kind: "payment",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted payment. At most one exists per order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub amount: Money,
    pub status: PaymentStatus,
    pub processed_at: DateTime<Utc>,
}

/// A payment about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub order_id: OrderId,
    pub amount: Money,
    pub status: PaymentStatus,
}

impl NewPayment {
    /// A completed payment for the given order.
    pub fn completed(order_id: OrderId, amount: Money) -> Self {
        Self {
            order_id,
            amount,
            status: PaymentStatus::Completed,
        }
    }

    pub fn into_payment(self, id: PaymentId, processed_at: DateTime<Utc>) -> Payment {
        Payment {
            id,
            order_id: self.order_id,
            amount: self.amount,
            status: self.status,
            processed_at,
        }
    }
}
