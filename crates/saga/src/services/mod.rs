//! Clients for the services the orchestrator calls synchronously.

pub mod payment;

pub use self::payment::{
    InMemoryPaymentClient, InProcessPaymentClient, PaymentBehavior, PaymentClient,
    PaymentClientError, PaymentReceipt,
};
