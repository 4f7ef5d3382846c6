//! Saga state, its closed status set and the audit trail.

pub mod event;
pub mod state;
pub mod status;

pub use event::{NewSagaEvent, SagaEvent, SagaEventType};
pub use state::{SagaState, SagaStep};
pub use status::SagaStatus;
