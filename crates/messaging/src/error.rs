use thiserror::Error;

/// Errors raised at the message bus boundary.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// An inbound payload could not be decoded.
    #[error("Malformed event on {topic}: {reason}")]
    Malformed { topic: String, reason: String },

    /// Every publish attempt failed.
    #[error("Publishing to {topic} failed after {attempts} attempts: {last_error}")]
    PublishExhausted {
        topic: String,
        attempts: u32,
        last_error: String,
    },

    /// The broker refused or could not accept the message.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// An outbound payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
