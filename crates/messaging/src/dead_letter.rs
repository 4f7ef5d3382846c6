use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Event, topics};

/// Why a message ended up in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterErrorType {
    /// The payload could not be decoded.
    MalformedEvent,
    /// The payload decoded but its handler failed.
    UnexpectedError,
}

/// A message that could not be processed, kept for inspection or replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    pub original_message: String,
    pub error_type: DeadLetterErrorType,
    pub error_message: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterMessage {
    pub fn new(
        original_message: impl Into<String>,
        error_type: DeadLetterErrorType,
        error_message: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            original_message: original_message.into(),
            error_type,
            error_message: error_message.into(),
            service: service.into(),
            timestamp: Utc::now(),
        }
    }
}

impl Event for DeadLetterMessage {
    fn topic(&self) -> &'static str {
        topics::DEAD_LETTER_QUEUE
    }

    fn key(&self) -> String {
        self.service.clone()
    }

    fn name(&self) -> &'static str {
        "DeadLetter"
    }
}
