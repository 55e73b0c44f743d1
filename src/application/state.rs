//! Client-side call state
//!
//! `CallPhase` is the local finite-state-machine value; `CallSnapshot` is
//! the reactive view a call screen binds to. Neither is ever persisted; the
//! durable record is the `CallSession` row.

use crate::domain::session::entity::Participant;
use crate::domain::session::value_object::EndReason;
use crate::domain::shared::error::CallError;
use crate::domain::shared::value_objects::CallId;
use crate::infrastructure::media::quality::NetworkQuality;
use crate::infrastructure::media::stream::{LocalStream, RemoteStream};
use serde::{Deserialize, Serialize};

/// Local call state machine value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// No call in progress
    Idle,
    /// Outbound call placed, waiting for the callee
    Calling,
    /// Inbound call ringing on this device
    Incoming,
    /// Accepted on both sides, peer negotiation running
    Connecting,
    /// Media flowing
    InCall,
    /// Terminal; a fresh call needs a fresh machine
    Ended,
}

impl CallPhase {
    pub fn is_live(&self) -> bool {
        !matches!(self, CallPhase::Idle | CallPhase::Ended)
    }

    pub fn as_str(&self) -> &str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::Calling => "calling",
            CallPhase::Incoming => "incoming",
            CallPhase::Connecting => "connecting",
            CallPhase::InCall => "in_call",
            CallPhase::Ended => "ended",
        }
    }
}

/// Reactive view of the machine, published on every transition
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub call_id: Option<CallId>,
    pub remote: Option<Participant>,
    pub local_stream: Option<LocalStream>,
    pub remote_stream: Option<RemoteStream>,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub remote_muted: bool,
    pub remote_video_off: bool,
    pub network_quality: NetworkQuality,
    pub end_reason: Option<EndReason>,
    /// Surfaced at most once per attempt; ring timeouts present as a
    /// missed call, not an error
    pub last_error: Option<CallError>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            call_id: None,
            remote: None,
            local_stream: None,
            remote_stream: None,
            is_muted: false,
            is_video_off: false,
            remote_muted: false,
            remote_video_off: false,
            network_quality: NetworkQuality::Good,
            end_reason: None,
            last_error: None,
        }
    }
}
