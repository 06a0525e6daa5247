//! Error types for the hatchery service.
//!
//! Errors fall into a few classes that decide how a loop reacts:
//! - transient (transport, timeouts): retried by the next pass
//! - data (malformed payloads or annotations): the item is skipped
//! - not-found races: absorbed silently by the caller
//! - authorization: surfaced to the caller, who decides whether to stop

use std::time::Duration;

use hatchery_events::{EventError, StreamError, StreamErrorKind};
use hatchery_networking::NetworkError;
use thiserror::Error;

/// Errors returned by the job backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The job or worker does not exist (any more).
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials were refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The backend refused a booking (another hatchery won).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The call did not complete in time.
    #[error("backend call {operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// Network or HTTP failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BackendError::Unauthorized(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, BackendError::Rejected(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// Errors returned by a compute provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The instance or template does not exist.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The call did not complete in time.
    #[error("provider call {operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// The provider refused the operation in the instance's current state.
    #[error("refused: {0}")]
    Refused(String),

    /// Any other provider API failure.
    #[error("provider API error: {0}")]
    Api(String),
}

/// Umbrella error for hatchery loops.
#[derive(Debug, Error)]
pub enum HatcheryError {
    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("event: {0}")]
    Event(#[from] EventError),

    #[error("event stream: {0}")]
    Stream(#[from] StreamError),

    #[error("network: {0}")]
    Network(#[from] NetworkError),

    #[error("invalid worker model path: {0}")]
    InvalidModelPath(String),

    #[error("no template for model {0}")]
    MissingTemplate(String),
}

impl HatcheryError {
    /// Returns true when the loop that produced this error cannot make
    /// progress without operator action.
    pub fn is_fatal(&self) -> bool {
        match self {
            HatcheryError::Backend(e) => e.is_unauthorized(),
            HatcheryError::Stream(e) => e.kind == StreamErrorKind::Unauthorized,
            _ => false,
        }
    }
}

/// Result type for hatchery operations.
pub type HatcheryResult<T> = Result<T, HatcheryError>;
