//! Payloads and stream failure classification.

use hatchery_id::JobId;
use serde::{Deserialize, Serialize};

/// Payload of a job event. Only the identity is trusted; the full job is
/// always re-fetched from the backend before acting on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEventPayload {
    /// Job identity.
    pub id: JobId,

    /// Status as reported in the event, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Close code sent when the peer is going away (server restart).
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code used when a connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// How a stream failure should be handled by the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// The connection dropped; re-send the filter set and carry on.
    Disconnected,

    /// The backend refused the subscription credentials.
    Unauthorized,

    /// Anything else; surfaced to the caller.
    Other,
}

/// A failure reported by the event stream transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
}

impl StreamError {
    /// Classifies a close frame code.
    pub fn from_close_code(code: u16, reason: impl Into<String>) -> Self {
        let kind = match code {
            CLOSE_GOING_AWAY | CLOSE_ABNORMAL => StreamErrorKind::Disconnected,
            _ => StreamErrorKind::Other,
        };
        Self {
            kind,
            message: format!("stream closed with code {}: {}", code, reason.into()),
        }
    }

    /// A dropped connection (EOF or reset) with no close code.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Disconnected,
            message: message.into(),
        }
    }

    /// Credentials were refused.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Unauthorized,
            message: message.into(),
        }
    }

    /// Any other transport failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Other,
            message: message.into(),
        }
    }

    /// Returns true if re-sending the filter set is the right response.
    pub fn should_resubscribe(&self) -> bool {
        self.kind == StreamErrorKind::Disconnected
    }
}
