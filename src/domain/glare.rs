//! Glare resolution policy
//!
//! When both sides of a relationship call each other within the same short
//! window, two competing sessions exist for one participant pair. Both
//! clients must pick the same survivor independently, using only the two
//! session rows, with no server-side arbitration.

use crate::domain::session::aggregate::CallSession;
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use chrono::{DateTime, Utc};

/// Total ordering key for competing sessions. The session with the smaller
/// key survives; `call_id` breaks the (unlikely) tie on identical caller and
/// creation instant so the decision stays total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GlareKey {
    caller_id: ParticipantId,
    created_at: DateTime<Utc>,
    call_id: CallId,
}

impl GlareKey {
    pub fn of(session: &CallSession) -> Self {
        Self {
            caller_id: session.caller().id(),
            created_at: session.created_at(),
            call_id: session.id(),
        }
    }
}

/// Pick the surviving session out of two competing attempts.
///
/// Returns the winner's call id. Symmetric: `winner(a, b) == winner(b, a)`.
pub fn winner(a: &CallSession, b: &CallSession) -> CallId {
    debug_assert!(a.same_pair(b), "glare resolution requires a shared pair");
    if GlareKey::of(a) <= GlareKey::of(b) {
        a.id()
    } else {
        b.id()
    }
}

/// Whether `ours` loses to the competing session `theirs`.
pub fn loses_to(ours: &CallSession, theirs: &CallSession) -> bool {
    winner(ours, theirs) == theirs.id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::entity::Participant;
    use crate::domain::session::value_object::Role;

    fn pair() -> (Participant, Participant) {
        (
            Participant::new(ParticipantId::new(), Role::Child, None),
            Participant::new(ParticipantId::new(), Role::Parent, None),
        )
    }

    #[test]
    fn test_winner_is_symmetric() {
        let (x, y) = pair();
        let a = CallSession::new(x.clone(), y.clone());
        let b = CallSession::new(y, x);

        assert_eq!(winner(&a, &b), winner(&b, &a));
    }

    #[test]
    fn test_exactly_one_loser() {
        let (x, y) = pair();
        let a = CallSession::new(x.clone(), y.clone());
        let b = CallSession::new(y, x);

        assert_ne!(loses_to(&a, &b), loses_to(&b, &a));
    }

    #[test]
    fn test_smaller_caller_id_wins() {
        let (x, y) = pair();
        let a = CallSession::new(x.clone(), y.clone());
        let b = CallSession::new(y.clone(), x.clone());

        // Distinct callers, so the caller id decides regardless of which
        // session was created first.
        let expected = if x.id() < y.id() { a.id() } else { b.id() };
        assert_eq!(winner(&a, &b), expected);
    }
}
