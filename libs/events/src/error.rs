//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding stream events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The event is not of the expected type.
    #[error("unexpected event type: expected {expected}, got {actual}")]
    UnexpectedType {
        expected: &'static str,
        actual: String,
    },

    /// The event payload is invalid.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
