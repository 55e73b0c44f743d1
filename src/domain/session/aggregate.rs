//! Call session aggregate root

use crate::domain::session::entity::Participant;
use crate::domain::session::event::{SessionEvent, SessionEventKind};
use crate::domain::session::value_object::{CallStatus, EndReason};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Call session aggregate root
///
/// The durable record of a single call attempt between exactly two
/// participants. Enforces the monotonic status lifecycle and writes the end
/// reason exactly once, at the transition into a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    /// Aggregate root ID, generated by the caller at start time
    id: CallId,
    /// Calling party
    caller: Participant,
    /// Called party
    callee: Participant,
    /// Current status
    status: CallStatus,
    /// When the caller created the session
    created_at: DateTime<Utc>,
    /// When the call went active (if it did)
    answered_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal status
    ended_at: Option<DateTime<Utc>>,
    /// Why the session ended
    end_reason: Option<EndReason>,
    /// Pending domain events
    #[serde(skip)]
    events: Vec<SessionEvent>,
}

impl CallSession {
    /// Create a new session in `Requested` status
    pub fn new(caller: Participant, callee: Participant) -> Self {
        let id = CallId::new();
        let mut session = Self {
            id,
            caller: caller.clone(),
            callee: callee.clone(),
            status: CallStatus::Requested,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
            events: Vec::new(),
        };

        session.record_event(SessionEventKind::Requested { caller, callee });
        session
    }

    /// Callee's client acknowledged the request and is alerting
    pub fn ring(&mut self) -> Result<()> {
        self.transition_to(CallStatus::Ringing)?;
        self.record_event(SessionEventKind::Ringing);
        Ok(())
    }

    /// Callee accepted the call
    pub fn accept(&mut self) -> Result<()> {
        self.transition_to(CallStatus::Accepted)?;
        self.record_event(SessionEventKind::Accepted);
        Ok(())
    }

    /// Peer connection negotiation started
    pub fn connect(&mut self) -> Result<()> {
        self.transition_to(CallStatus::Connecting)?;
        self.record_event(SessionEventKind::Connecting);
        Ok(())
    }

    /// Negotiation completed, media is flowing
    pub fn activate(&mut self) -> Result<()> {
        self.transition_to(CallStatus::Active)?;
        let answered_at = Utc::now();
        self.answered_at = Some(answered_at);
        self.record_event(SessionEventKind::Activated { answered_at });
        Ok(())
    }

    /// End the call (hangup, cancel, supersede)
    pub fn end(&mut self, reason: EndReason) -> Result<()> {
        self.terminate(CallStatus::Ended, reason)
    }

    /// Callee declined
    pub fn reject(&mut self) -> Result<()> {
        self.terminate(CallStatus::Rejected, EndReason::CalleeRejected)
    }

    /// Ringing window elapsed without an answer
    pub fn miss(&mut self) -> Result<()> {
        self.terminate(CallStatus::Missed, EndReason::Timeout)
    }

    /// Media acquisition or negotiation failed
    pub fn fail(&mut self, reason: EndReason) -> Result<()> {
        self.terminate(CallStatus::Failed, reason)
    }

    /// Abandoned in favor of a concurrent competing attempt
    pub fn supersede(&mut self) -> Result<()> {
        self.terminate(CallStatus::Ended, EndReason::Superseded)
    }

    fn terminate(&mut self, status: CallStatus, reason: EndReason) -> Result<()> {
        self.transition_to(status)?;
        let ended_at = Utc::now();
        self.ended_at = Some(ended_at);
        self.end_reason = Some(reason);

        let duration_seconds = self
            .answered_at
            .map(|answered| (ended_at - answered).num_seconds());
        self.record_event(SessionEventKind::Terminated {
            reason,
            ended_at,
            duration_seconds,
        });
        Ok(())
    }

    fn transition_to(&mut self, new_status: CallStatus) -> Result<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(CallError::InvalidCallState(format!(
                "call {}: cannot transition from {:?} to {:?}",
                self.id, self.status, new_status
            )));
        }
        self.status = new_status;
        Ok(())
    }

    fn record_event(&mut self, kind: SessionEventKind) {
        self.events.push(SessionEvent::new(self.id, kind));
    }

    /// Take all pending events
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// The other participant, from `me`'s point of view
    pub fn counterpart(&self, me: ParticipantId) -> Option<&Participant> {
        if self.caller.id() == me {
            Some(&self.callee)
        } else if self.callee.id() == me {
            Some(&self.caller)
        } else {
            None
        }
    }

    pub fn involves(&self, id: ParticipantId) -> bool {
        self.caller.id() == id || self.callee.id() == id
    }

    /// Whether this and `other` are concurrent attempts between the same
    /// unordered pair of participants.
    pub fn same_pair(&self, other: &CallSession) -> bool {
        let mine = PairKey::of(self);
        mine == PairKey::of(other)
    }

    // Getters
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn caller(&self) -> &Participant {
        &self.caller
    }

    pub fn callee(&self) -> &Participant {
        &self.callee
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn answered_at(&self) -> Option<DateTime<Utc>> {
        self.answered_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.answered_at
            .and_then(|answered| self.ended_at.map(|ended| ended - answered))
    }
}

/// Unordered participant pair, the key for the one-live-session invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey(ParticipantId, ParticipantId);

impl PairKey {
    pub fn new(a: ParticipantId, b: ParticipantId) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub fn of(session: &CallSession) -> Self {
        Self::new(session.caller.id(), session.callee.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::value_object::Role;

    fn test_session() -> CallSession {
        let caller = Participant::new(ParticipantId::new(), Role::Child, Some("Mia".to_string()));
        let callee = Participant::new(ParticipantId::new(), Role::Parent, Some("Dana".to_string()));
        CallSession::new(caller, callee)
    }

    #[test]
    fn test_session_lifecycle() {
        let mut session = test_session();
        assert_eq!(session.status(), CallStatus::Requested);
        assert_eq!(session.events.len(), 1);

        session.ring().unwrap();
        session.accept().unwrap();
        session.connect().unwrap();
        session.activate().unwrap();
        assert!(session.answered_at().is_some());

        session.end(EndReason::NormalHangup).unwrap();
        assert_eq!(session.status(), CallStatus::Ended);
        assert_eq!(session.end_reason(), Some(EndReason::NormalHangup));
        assert!(session.ended_at().is_some());
        assert!(session.duration().is_some());

        let events = session.take_events();
        assert_eq!(events.len(), 6);
        assert_eq!(events.last().unwrap().event_type(), "session.terminated");
    }

    #[test]
    fn test_terminal_is_immutable() {
        let mut session = test_session();
        session.reject().unwrap();
        assert_eq!(session.end_reason(), Some(EndReason::CalleeRejected));

        assert!(session.accept().is_err());
        assert!(session.end(EndReason::NormalHangup).is_err());
        // The first reason stays
        assert_eq!(session.end_reason(), Some(EndReason::CalleeRejected));
    }

    #[test]
    fn test_cannot_activate_without_accept() {
        let mut session = test_session();
        assert!(session.activate().is_err());
        session.ring().unwrap();
        assert!(session.activate().is_err());
    }

    #[test]
    fn test_missed_call() {
        let mut session = test_session();
        session.ring().unwrap();
        session.miss().unwrap();
        assert_eq!(session.status(), CallStatus::Missed);
        assert_eq!(session.end_reason(), Some(EndReason::Timeout));
        assert!(session.answered_at().is_none());
        assert!(session.duration().is_none());
    }

    #[test]
    fn test_pair_key_is_unordered() {
        let session = test_session();
        let key = PairKey::of(&session);
        let flipped = PairKey::new(session.callee().id(), session.caller().id());
        assert_eq!(key, flipped);
    }

    #[test]
    fn test_counterpart() {
        let session = test_session();
        let caller_id = session.caller().id();
        let callee_id = session.callee().id();
        assert_eq!(session.counterpart(caller_id).unwrap().id(), callee_id);
        assert_eq!(session.counterpart(callee_id).unwrap().id(), caller_id);
        assert!(session.counterpart(ParticipantId::new()).is_none());
    }
}
