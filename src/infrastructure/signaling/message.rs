//! Signaling channel messages
//!
//! A closed tagged union so the call machine can pattern-match exhaustively;
//! unknown or malformed payloads fail at the channel boundary, not inside
//! the state machine.

use crate::domain::shared::value_objects::{CallId, ParticipantId};
use serde::{Deserialize, Serialize};

/// Envelope carried on a per-call channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub call_id: CallId,
    pub sender_id: ParticipantId,
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn new(call_id: CallId, sender_id: ParticipantId, payload: SignalPayload) -> Self {
        Self {
            call_id,
            sender_id,
            payload,
        }
    }
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// SDP offer
    Offer { sdp: String },
    /// SDP answer
    Answer { sdp: String },
    /// ICE candidate
    Candidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u32>,
    },
    /// Local control flags mirrored to the peer's UI
    Control { muted: bool, video_off: bool },
    /// Call lifecycle notification. A hint only; lifecycle decisions are
    /// always derivable from the persisted session status.
    Lifecycle { notice: LifecycleNotice },
}

/// Lifecycle notifications exchanged between the two participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleNotice {
    Requested,
    Accepted,
    Rejected,
    Hangup,
    Superseded,
}

/// Channel name for a call, one channel per call
pub fn channel_name(call_id: CallId) -> String {
    format!("call-{}", call_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_tag_shape() {
        let env = SignalEnvelope::new(
            CallId::new(),
            ParticipantId::new(),
            SignalPayload::Offer {
                sdp: "v=0".to_string(),
            },
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"offer\""));

        let back: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.payload, SignalPayload::Offer { .. }));
    }

    #[test]
    fn test_lifecycle_snake_case() {
        let json = serde_json::to_string(&SignalPayload::Lifecycle {
            notice: LifecycleNotice::Requested,
        })
        .unwrap();
        assert!(json.contains("\"lifecycle\""));
        assert!(json.contains("\"requested\""));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = serde_json::from_str::<SignalPayload>("{\"type\":\"mystery\"}");
        assert!(err.is_err());
    }

    #[test]
    fn test_channel_name() {
        let id = CallId::new();
        assert_eq!(channel_name(id), format!("call-{}", id));
    }
}
