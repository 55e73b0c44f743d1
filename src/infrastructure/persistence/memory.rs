//! In-memory session store
//!
//! Stands in for the managed persistence collaborator in the demo and tests.
//! Enforces the one-live-session-per-pair invariant on insert and terminal
//! immutability on update, and publishes every write on an update feed.

use crate::domain::session::aggregate::{CallSession, PairKey};
use crate::domain::session::repository::{InsertOutcome, SessionStore};
use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

const FEED_CAPACITY: usize = 256;

/// In-memory row-per-call store with an update feed
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<CallId, CallSession>>,
    feed: broadcast::Sender<CallSession>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            feed,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// All non-terminal sessions (diagnostics)
    pub fn live_sessions(&self) -> Vec<CallSession> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect()
    }

    fn publish(&self, session: &CallSession) {
        let _ = self.feed.send(session.clone());
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: &CallSession) -> Result<InsertOutcome> {
        let key = PairKey::of(session);
        let mut sessions = self.sessions.write().unwrap();

        if let Some(existing) = sessions
            .values()
            .find(|s| !s.is_terminal() && PairKey::of(s) == key && s.id() != session.id())
        {
            debug!(
                call_id = %session.id(),
                existing = %existing.id(),
                "insert refused: live session exists for pair"
            );
            return Ok(InsertOutcome::Conflict(existing.clone()));
        }

        info!(call_id = %session.id(), status = session.status().as_str(), "session created");
        sessions.insert(session.id(), session.clone());
        drop(sessions);
        self.publish(session);
        Ok(InsertOutcome::Created)
    }

    async fn update(&self, session: &CallSession) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap();
        let existing = sessions
            .get(&session.id())
            .ok_or_else(|| CallError::NotFound(format!("session {}", session.id())))?;

        if existing.is_terminal() {
            // Re-writing the identical terminal state is accepted so that
            // racing hangups from both sides converge; anything else is a
            // late write against a final row.
            if existing.status() == session.status()
                && existing.end_reason() == session.end_reason()
            {
                return Ok(());
            }
            return Err(CallError::InvalidCallState(format!(
                "session {} is already {} ({:?})",
                session.id(),
                existing.status().as_str(),
                existing.end_reason()
            )));
        }

        // Reachability, not adjacency: a client may advance its aggregate
        // through several hops before the write lands here.
        if existing.status() != session.status()
            && !existing.status().can_reach(session.status())
        {
            return Err(CallError::InvalidCallState(format!(
                "session {}: cannot move from {} to {}",
                session.id(),
                existing.status().as_str(),
                session.status().as_str()
            )));
        }

        debug!(
            call_id = %session.id(),
            status = session.status().as_str(),
            "session updated"
        );
        sessions.insert(session.id(), session.clone());
        drop(sessions);
        self.publish(session);
        Ok(())
    }

    async fn find_by_id(&self, id: CallId) -> Result<Option<CallSession>> {
        Ok(self.sessions.read().unwrap().get(&id).cloned())
    }

    async fn find_live_for_pair(
        &self,
        a: ParticipantId,
        b: ParticipantId,
    ) -> Result<Option<CallSession>> {
        let key = PairKey::new(a, b);
        Ok(self
            .sessions
            .read()
            .unwrap()
            .values()
            .find(|s| !s.is_terminal() && PairKey::of(s) == key)
            .cloned())
    }

    async fn find_live_for_participant(&self, id: ParticipantId) -> Result<Option<CallSession>> {
        Ok(self
            .sessions
            .read()
            .unwrap()
            .values()
            .find(|s| !s.is_terminal() && s.involves(id))
            .cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<CallSession> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::entity::Participant;
    use crate::domain::session::value_object::{CallStatus, Role};

    fn participants() -> (Participant, Participant) {
        (
            Participant::new(ParticipantId::new(), Role::Child, None),
            Participant::new(ParticipantId::new(), Role::Parent, None),
        )
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = InMemorySessionStore::new();
        let (child, parent) = participants();
        let session = CallSession::new(child, parent);

        assert!(matches!(
            store.insert(&session).await.unwrap(),
            InsertOutcome::Created
        ));
        let found = store.find_by_id(session.id()).await.unwrap().unwrap();
        assert_eq!(found.status(), CallStatus::Requested);
    }

    #[tokio::test]
    async fn test_live_pair_conflict() {
        let store = InMemorySessionStore::new();
        let (child, parent) = participants();

        let first = CallSession::new(child.clone(), parent.clone());
        store.insert(&first).await.unwrap();

        // Second attempt for the same pair, either direction, conflicts
        let second = CallSession::new(parent, child);
        match store.insert(&second).await.unwrap() {
            InsertOutcome::Conflict(existing) => assert_eq!(existing.id(), first.id()),
            InsertOutcome::Created => panic!("duplicate live row created"),
        }
    }

    #[tokio::test]
    async fn test_terminal_row_is_immutable() {
        let store = InMemorySessionStore::new();
        let (child, parent) = participants();
        let mut session = CallSession::new(child, parent);
        store.insert(&session).await.unwrap();

        session.reject().unwrap();
        store.update(&session).await.unwrap();

        // Identical terminal re-write converges
        store.update(&session).await.unwrap();

        // Terminal row also frees the pair for a fresh attempt
        let fresh = CallSession::new(
            session.caller().clone(),
            session.callee().clone(),
        );
        assert!(matches!(
            store.insert(&fresh).await.unwrap(),
            InsertOutcome::Created
        ));
    }

    #[tokio::test]
    async fn test_update_feed_publishes_writes() {
        let store = InMemorySessionStore::new();
        let mut rx = store.subscribe();

        let (child, parent) = participants();
        let mut session = CallSession::new(child, parent);
        store.insert(&session).await.unwrap();
        session.ring().unwrap();
        store.update(&session).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().status(), CallStatus::Requested);
        assert_eq!(rx.recv().await.unwrap().status(), CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_invalid_status_jump_rejected() {
        let store = InMemorySessionStore::new();
        let (child, parent) = participants();
        let session = CallSession::new(child.clone(), parent.clone());
        store.insert(&session).await.unwrap();

        // Requested -> Active skips accept/connect
        let mut jumped = session.clone();
        jumped.accept().unwrap();
        jumped.connect().unwrap();
        jumped.activate().unwrap();
        // Walking the aggregate through is fine...
        store.update(&jumped).await.unwrap();

        // ...but a write whose transition the stored row cannot reach is not
        let stale = session; // still Requested
        let mut regressed = stale;
        regressed.ring().unwrap();
        // Active -> Ringing is invalid against the stored row
        assert!(store.update(&regressed).await.is_err());
    }
}
