//! Session store interface

use crate::domain::session::aggregate::CallSession;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Outcome of inserting a new session
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// Session row created
    Created,
    /// A non-terminal session already exists for the same participant pair.
    /// The caller must join or supersede it, never create a duplicate row.
    Conflict(CallSession),
}

/// Repository interface for the CallSession aggregate
///
/// Defined in the domain layer as a port; the in-memory adapter lives in the
/// infrastructure layer and the managed backend is an external collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a freshly created session, enforcing the one-live-session
    /// invariant per unordered participant pair.
    async fn insert(&self, session: &CallSession) -> Result<InsertOutcome>;

    /// Persist a status transition. Terminal rows are immutable; re-writing
    /// the identical terminal state is accepted so racing hangups converge.
    async fn update(&self, session: &CallSession) -> Result<()>;

    /// Find a session by its ID
    async fn find_by_id(&self, id: CallId) -> Result<Option<CallSession>>;

    /// Find the live (non-terminal) session for an unordered pair, if any
    async fn find_live_for_pair(
        &self,
        a: ParticipantId,
        b: ParticipantId,
    ) -> Result<Option<CallSession>>;

    /// Find the live (non-terminal) session a participant is part of, if
    /// any. Used by the fallback poll to spot inbound requests whose feed
    /// delivery was lost.
    async fn find_live_for_participant(&self, id: ParticipantId) -> Result<Option<CallSession>>;

    /// Subscribe to session updates. Each insert/update is published; the
    /// consumer filters for sessions it participates in.
    fn subscribe(&self) -> broadcast::Receiver<CallSession>;
}
