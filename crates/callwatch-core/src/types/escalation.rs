use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CallId;

/// Raw `escalation` event body as pushed by the backend.
/// Every field is optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EscalationPayload {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// An escalation notification, stamped with its local arrival time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub call_id: CallId,
    pub reason: Option<String>,
    pub score: Option<f64>,
    pub received_at: DateTime<Utc>,
}

impl EscalationEvent {
    /// Returns `None` when the payload carries no usable call id.
    pub fn from_payload(payload: EscalationPayload, received_at: DateTime<Utc>) -> Option<Self> {
        let call_id = payload.call_id.filter(|id| !id.is_empty())?;
        Some(Self {
            call_id: CallId::new(call_id),
            reason: payload.reason,
            score: payload.score,
            received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_without_call_id_is_dropped() {
        let payload: EscalationPayload =
            serde_json::from_value(serde_json::json!({"reason": "angry"})).unwrap();
        assert!(EscalationEvent::from_payload(payload, Utc::now()).is_none());

        let empty = EscalationPayload {
            call_id: Some(String::new()),
            ..Default::default()
        };
        assert!(EscalationEvent::from_payload(empty, Utc::now()).is_none());
    }

    #[test]
    fn payload_fields_carry_over() {
        let payload: EscalationPayload = serde_json::from_value(serde_json::json!({
            "call_id": "c1",
            "reason": "legal threat",
            "score": 0.92
        }))
        .unwrap();
        let event = EscalationEvent::from_payload(payload, Utc::now()).unwrap();
        assert_eq!(event.call_id.as_str(), "c1");
        assert_eq!(event.reason.as_deref(), Some("legal threat"));
        assert_eq!(event.score, Some(0.92));
    }
}
