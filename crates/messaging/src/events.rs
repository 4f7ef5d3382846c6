//! Event payloads carried on the bus.

use chrono::{DateTime, Utc};
use common::{CorrelationId, IdempotencyKey, Money, OrderId, PaymentId, SagaId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::bus::Message;
use crate::{MessagingError, topics};

/// An outbound event: knows its topic and partition key.
pub trait Event: Serialize + Send + Sync {
    fn topic(&self) -> &'static str;

    fn key(&self) -> String;

    /// Name used in logs and metrics labels.
    fn name(&self) -> &'static str;
}

/// Decodes an inbound message, mapping any failure to `Malformed`.
pub fn decode<E: DeserializeOwned>(message: &Message) -> Result<E, MessagingError> {
    serde_json::from_str(&message.payload).map_err(|e| MessagingError::Malformed {
        topic: message.topic.clone(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEventType {
    OrderCreated,
}

/// Published by the gateway on `order-events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedEvent {
    pub event_type: OrderEventType,
    pub saga_id: SagaId,
    pub customer_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub amount: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub idempotency_key: IdempotencyKey,
    pub timestamp: DateTime<Utc>,
}

impl OrderCreatedEvent {
    pub fn new(
        saga_id: SagaId,
        customer_id: impl Into<String>,
        product_id: impl Into<String>,
        quantity: u32,
        amount: Money,
    ) -> Self {
        Self {
            event_type: OrderEventType::OrderCreated,
            saga_id,
            customer_id: customer_id.into(),
            product_id: product_id.into(),
            quantity,
            amount,
            correlation_id: None,
            idempotency_key: IdempotencyKey::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

impl Event for OrderCreatedEvent {
    fn topic(&self) -> &'static str {
        topics::ORDER_EVENTS
    }

    fn key(&self) -> String {
        self.customer_id.clone()
    }

    fn name(&self) -> &'static str {
        "OrderCreated"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentEventType {
    PaymentProcessed,
    PaymentFailed,
    PaymentCancelled,
}

impl PaymentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentEventType::PaymentProcessed => "PaymentProcessed",
            PaymentEventType::PaymentFailed => "PaymentFailed",
            PaymentEventType::PaymentCancelled => "PaymentCancelled",
        }
    }
}

/// Published by the payment processor on `payment-events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub event_type: PaymentEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<PaymentId>,
    pub order_id: OrderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub idempotency_key: IdempotencyKey,
    pub timestamp: DateTime<Utc>,
}

// Convenience constructors
impl PaymentEvent {
    fn new(event_type: PaymentEventType, order_id: OrderId) -> Self {
        Self {
            event_type,
            payment_id: None,
            order_id,
            amount: None,
            status: None,
            reason: None,
            idempotency_key: IdempotencyKey::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn processed(
        payment_id: PaymentId,
        order_id: OrderId,
        amount: Money,
        status: impl Into<String>,
    ) -> Self {
        Self {
            payment_id: Some(payment_id),
            amount: Some(amount),
            status: Some(status.into()),
            ..Self::new(PaymentEventType::PaymentProcessed, order_id)
        }
    }

    pub fn failed(order_id: OrderId, amount: Money, reason: impl Into<String>) -> Self {
        Self {
            amount: Some(amount),
            reason: Some(reason.into()),
            ..Self::new(PaymentEventType::PaymentFailed, order_id)
        }
    }

    pub fn cancelled(payment_id: PaymentId, order_id: OrderId) -> Self {
        Self {
            payment_id: Some(payment_id),
            ..Self::new(PaymentEventType::PaymentCancelled, order_id)
        }
    }
}

impl Event for PaymentEvent {
    fn topic(&self) -> &'static str {
        topics::PAYMENT_EVENTS
    }

    fn key(&self) -> String {
        self.order_id.to_string()
    }

    fn name(&self) -> &'static str {
        self.event_type.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationEventType {
    OrderCancelled,
    PaymentCancelled,
}

/// Emitted by the orchestrator on `compensation-events` while compensating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationEvent {
    pub event_type: CompensationEventType,
    /// The cancelled order or payment ID.
    pub entity_id: i64,
    /// Order the compensation belongs to; used as the message key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
    pub idempotency_key: IdempotencyKey,
    pub timestamp: DateTime<Utc>,
}

impl CompensationEvent {
    pub fn order_cancelled(order_id: OrderId) -> Self {
        Self {
            event_type: CompensationEventType::OrderCancelled,
            entity_id: order_id.as_i64(),
            order_id: Some(order_id),
            idempotency_key: IdempotencyKey::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn payment_cancelled(payment_id: PaymentId, order_id: OrderId) -> Self {
        Self {
            event_type: CompensationEventType::PaymentCancelled,
            entity_id: payment_id.as_i64(),
            order_id: Some(order_id),
            idempotency_key: IdempotencyKey::new(),
            timestamp: Utc::now(),
        }
    }
}

impl Event for CompensationEvent {
    fn topic(&self) -> &'static str {
        topics::COMPENSATION_EVENTS
    }

    fn key(&self) -> String {
        self.order_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| self.entity_id.to_string())
    }

    fn name(&self) -> &'static str {
        match self.event_type {
            CompensationEventType::OrderCancelled => "OrderCancelled",
            CompensationEventType::PaymentCancelled => "PaymentCancelled",
        }
    }
}

/// Reply to the gateway on `order-response` once the order is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponseMessage {
    pub order_id: OrderId,
    pub correlation_id: Option<CorrelationId>,
    pub saga_id: SagaId,
    pub status: String,
}

impl Event for OrderResponseMessage {
    fn topic(&self) -> &'static str {
        topics::ORDER_RESPONSE
    }

    fn key(&self) -> String {
        self.saga_id.to_string()
    }

    fn name(&self) -> &'static str {
        "OrderResponse"
    }
}
