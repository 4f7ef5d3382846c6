//! Topic names shared by every service.

pub const ORDER_EVENTS: &str = "order-events";
pub const PAYMENT_EVENTS: &str = "payment-events";
pub const COMPENSATION_EVENTS: &str = "compensation-events";
pub const ORDER_RESPONSE: &str = "order-response";
pub const DEAD_LETTER_QUEUE: &str = "dead-letter-queue";
