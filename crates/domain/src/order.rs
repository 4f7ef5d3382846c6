//! Order record and its lifecycle status.

use chrono::{DateTime, Utc};
use common::{Money, OrderId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The status of an order.
///
/// Orders are only ever moved by the saga orchestrator:
/// ```text
/// Waiting ──► Processing ──┬──► Completed
///    │                     ├──► Refunded
///    │                     └──► Cancelled (compensated)
///    └──► Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order accepted, payment not yet confirmed.
    #[default]
    Waiting,
    /// Payment accepted, awaiting confirmation.
    Processing,
    /// Payment confirmed (terminal state).
    Completed,
    /// Payment failed or never arrived (terminal state).
    Failed,
    /// Order compensated after a failure (terminal state).
    Cancelled,
    /// Payment was cancelled externally and refunded (terminal state).
    Refunded,
}

impl OrderStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Waiting | OrderStatus::Processing)
    }

    /// Returns the status name as stored and published.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Waiting => "WAITING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(OrderStatus::Waiting),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "COMPLETED" => Ok(OrderStatus::Completed),
            "FAILED" => Ok(OrderStatus::Failed),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "REFUNDED" => Ok(OrderStatus::Refunded),
            other => Err(DomainError::UnknownStatus {
                kind: "order",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted order. Never hard-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub customer_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub amount: Money,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An order that has not been persisted yet; the store assigns the ID.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub customer_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub amount: Money,
}

impl NewOrder {
    pub fn new(
        customer_id: impl Into<String>,
        product_id: impl Into<String>,
        quantity: u32,
        amount: Money,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            product_id: product_id.into(),
            quantity,
            amount,
        }
    }

    /// Materializes the order with a store-assigned ID in `Waiting` status.
    pub fn into_order(self, id: OrderId, now: DateTime<Utc>) -> Order {
        Order {
            id,
            customer_id: self.customer_id,
            product_id: self.product_id,
            quantity: self.quantity,
            amount: self.amount,
            status: OrderStatus::Waiting,
            created_at: now,
            updated_at: now,
        }
    }
}
