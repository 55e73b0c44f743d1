//! Read-only presence lookup
//!
//! The call core consults presence once, at call start, to decide whether to
//! attempt the call at all. It never writes presence; the online-indicator UI
//! and its update path live outside this crate.

use crate::domain::shared::value_objects::ParticipantId;

/// Read-only view of the presence module
pub trait PresenceReader: Send + Sync {
    /// Whether the participant is believed reachable right now
    fn is_reachable(&self, id: ParticipantId) -> bool;
}

/// Presence source that treats every participant as reachable. Used when the
/// surrounding application has no presence module wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

impl PresenceReader for AlwaysReachable {
    fn is_reachable(&self, _id: ParticipantId) -> bool {
        true
    }
}
