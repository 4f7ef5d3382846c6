//! Message bus boundary for the order saga services.
//!
//! Services talk to each other only through the topics in [`topics`]. The
//! [`MessageBus`] trait is the broker seam; [`InMemoryMessageBus`] is the
//! in-process broker used by the binary and the tests. Outbound events go
//! through one shared [`EventPublisher`] per service, which retries with
//! linear backoff. With the `kafka` feature, [`KafkaMessageBus`] runs the
//! same topics over a Kafka cluster.

pub mod bus;
pub mod dead_letter;
pub mod error;
pub mod events;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod publisher;
pub mod topics;

pub use bus::{DEFAULT_LOG_CAPACITY, InMemoryMessageBus, Message, MessageBus, Subscription};
pub use dead_letter::{DeadLetterErrorType, DeadLetterMessage};
pub use error::{MessagingError, Result};
pub use events::{
    CompensationEvent, CompensationEventType, Event, OrderCreatedEvent, OrderEventType,
    OrderResponseMessage, PaymentEvent, PaymentEventType, decode,
};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConfig, KafkaMessageBus};
pub use publisher::{EventPublisher, PublisherConfig};
