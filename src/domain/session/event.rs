//! Call session domain events

use crate::domain::session::entity::Participant;
use crate::domain::session::value_object::EndReason;
use crate::domain::shared::events::EventMetadata;
use crate::domain::shared::value_objects::CallId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event raised by the `CallSession` aggregate on each lifecycle transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub metadata: EventMetadata,
    pub call_id: CallId,
    pub kind: SessionEventKind,
}

/// What happened to the session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEventKind {
    Requested {
        caller: Participant,
        callee: Participant,
    },
    Ringing,
    Accepted,
    Connecting,
    Activated {
        answered_at: DateTime<Utc>,
    },
    Terminated {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_seconds: Option<i64>,
    },
}

impl SessionEvent {
    pub fn new(call_id: CallId, kind: SessionEventKind) -> Self {
        let event_type = match &kind {
            SessionEventKind::Requested { .. } => "session.requested",
            SessionEventKind::Ringing => "session.ringing",
            SessionEventKind::Accepted => "session.accepted",
            SessionEventKind::Connecting => "session.connecting",
            SessionEventKind::Activated { .. } => "session.activated",
            SessionEventKind::Terminated { .. } => "session.terminated",
        };
        Self {
            metadata: EventMetadata::new(event_type.to_string()),
            call_id,
            kind,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.metadata.event_type
    }
}
