//! Stream event envelope and subscription filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventError, JobEventPayload};

/// Event type emitted when a job run changes state.
pub const JOB_RUN_EVENT: &str = "run_job";

/// Status carried by job events when the job enters the waiting queue.
pub const STATUS_WAITING: &str = "Waiting";

/// Subscription filter sent to the backend.
///
/// The backend only pushes events matching at least one filter of the
/// current set. Re-sending the set replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventFilter {
    /// All job queue transitions.
    Queue,

    /// Worker registry changes.
    Workers,

    /// Transitions of one model's template.
    Model { path: String },
}

impl EventFilter {
    /// Filter set used by the intake loop.
    pub fn intake_set() -> Vec<EventFilter> {
        vec![EventFilter::Queue]
    }
}

/// The event envelope pushed by the backend stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// The event type (e.g., "run_job").
    pub event_type: String,

    /// Status of the subject after the transition, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// When the backend recorded the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,

    /// Event-specific payload, decoded on demand.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StreamEvent {
    /// Builds a "job entered waiting" event for a job payload.
    pub fn job_waiting(payload: serde_json::Value) -> Self {
        Self {
            event_type: JOB_RUN_EVENT.to_string(),
            status: Some(STATUS_WAITING.to_string()),
            occurred_at: Some(Utc::now()),
            payload,
        }
    }

    /// Returns true for job events announcing a job entered the queue.
    pub fn is_job_waiting(&self) -> bool {
        self.event_type == JOB_RUN_EVENT && self.status.as_deref() == Some(STATUS_WAITING)
    }

    /// Decodes the payload of a job event.
    pub fn decode_job(&self) -> Result<JobEventPayload, EventError> {
        if self.event_type != JOB_RUN_EVENT {
            return Err(EventError::UnexpectedType {
                expected: JOB_RUN_EVENT,
                actual: self.event_type.clone(),
            });
        }

        // Some producers double-encode the payload as a JSON string.
        let payload = match &self.payload {
            serde_json::Value::String(raw) => serde_json::from_str(raw)
                .map_err(|e| EventError::InvalidPayload(format!("{}: {}", raw, e)))?,
            value => serde_json::from_value(value.clone())
                .map_err(|e| EventError::InvalidPayload(format!("{}: {}", value, e)))?,
        };

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatchery_id::JobId;

    #[test]
    fn test_job_waiting_detection() {
        let event = StreamEvent::job_waiting(serde_json::json!({"id": 3}));
        assert!(event.is_job_waiting());

        let mut building = event.clone();
        building.status = Some("Building".to_string());
        assert!(!building.is_job_waiting());

        let mut other = event;
        other.event_type = "worker".to_string();
        assert!(!other.is_job_waiting());
    }

    #[test]
    fn test_decode_job_payload() {
        let event = StreamEvent::job_waiting(serde_json::json!({"id": 12, "status": "Waiting"}));
        let payload = event.decode_job().unwrap();
        assert_eq!(payload.id, JobId::new(12));
    }

    #[test]
    fn test_decode_double_encoded_payload() {
        let event = StreamEvent::job_waiting(serde_json::Value::String("{\"id\": 5}".to_string()));
        assert_eq!(event.decode_job().unwrap().id, JobId::new(5));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let event = StreamEvent::job_waiting(serde_json::json!({"name": "nope"}));
        assert!(matches!(
            event.decode_job(),
            Err(EventError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_decode_wrong_type() {
        let mut event = StreamEvent::job_waiting(serde_json::json!({"id": 1}));
        event.event_type = "worker".to_string();
        assert!(matches!(
            event.decode_job(),
            Err(EventError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn test_envelope_wire_format() {
        let json = r#"{"event_type":"run_job","status":"Waiting","payload":{"id":9}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        assert!(event.is_job_waiting());
        assert!(event.occurred_at.is_none());
    }

    #[test]
    fn test_filter_serialization() {
        let json = serde_json::to_string(&EventFilter::intake_set()).unwrap();
        assert_eq!(json, r#"[{"type":"queue"}]"#);

        let model = EventFilter::Model {
            path: "shared.infra/debian".to_string(),
        };
        let json = serde_json::to_string(&model).unwrap();
        assert!(json.contains("\"type\":\"model\""));
    }
}
