//! Call session value objects

use serde::{Deserialize, Serialize};

/// Role of a participant within the family account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Parent,
    Child,
    FamilyMember,
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Parent => "parent",
            Role::Child => "child",
            Role::FamilyMember => "family_member",
        }
    }
}

/// Persisted call session status
///
/// Monotonic: a session only moves forward through this lifecycle, and the
/// terminal statuses are final once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Caller created the session, callee not yet alerted
    Requested,
    /// Callee's client acknowledged and is alerting
    Ringing,
    /// Callee accepted, negotiation not yet started
    Accepted,
    /// Peer connection negotiation in progress
    Connecting,
    /// Media is flowing
    Active,
    /// Call completed or was abandoned
    Ended,
    /// Callee declined
    Rejected,
    /// Callee never answered within the ringing window
    Missed,
    /// Media or negotiation failure
    Failed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Rejected | CallStatus::Missed | CallStatus::Failed
        )
    }

    /// Check whether a status transition is valid
    pub fn can_transition_to(&self, new_status: CallStatus) -> bool {
        use CallStatus::*;

        match (self, new_status) {
            // From Requested
            (Requested, Ringing) => true,
            (Requested, Accepted) => true,
            (Requested, Ended | Rejected | Missed | Failed) => true,

            // From Ringing
            (Ringing, Accepted) => true,
            (Ringing, Ended | Rejected | Missed | Failed) => true,

            // From Accepted
            (Accepted, Connecting) => true,
            (Accepted, Active) => true,
            (Accepted, Ended | Failed) => true,

            // From Connecting
            (Connecting, Active) => true,
            (Connecting, Ended | Failed) => true,

            // From Active
            (Active, Ended | Failed) => true,

            // Terminal statuses are final
            _ => false,
        }
    }

    /// Whether `new_status` is reachable from this status through any number
    /// of valid transitions. Store writes are validated against this rather
    /// than single-hop adjacency: a client that advanced its aggregate
    /// through several hops before persisting still writes a monotonic row.
    pub fn can_reach(&self, new_status: CallStatus) -> bool {
        use CallStatus::*;

        match (self, new_status) {
            (Requested, s) => s != Requested,
            (Ringing, s) => !matches!(s, Requested | Ringing),
            (Accepted, Connecting | Active | Ended | Failed) => true,
            (Connecting, Active | Ended | Failed) => true,
            (Active, Ended | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CallStatus::Requested => "requested",
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Connecting => "connecting",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
            CallStatus::Missed => "missed",
            CallStatus::Failed => "failed",
        }
    }
}

/// Reason a session reached a terminal status, written exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    CalleeRejected,
    CallerCancelled,
    NormalHangup,
    Timeout,
    MediaError,
    Superseded,
}

impl EndReason {
    pub fn as_str(&self) -> &str {
        match self {
            EndReason::CalleeRejected => "callee_rejected",
            EndReason::CallerCancelled => "caller_cancelled",
            EndReason::NormalHangup => "normal_hangup",
            EndReason::Timeout => "timeout",
            EndReason::MediaError => "media_error",
            EndReason::Superseded => "superseded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_are_final() {
        for terminal in [
            CallStatus::Ended,
            CallStatus::Rejected,
            CallStatus::Missed,
            CallStatus::Failed,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                CallStatus::Requested,
                CallStatus::Ringing,
                CallStatus::Accepted,
                CallStatus::Connecting,
                CallStatus::Active,
                CallStatus::Ended,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            CallStatus::Requested,
            CallStatus::Ringing,
            CallStatus::Accepted,
            CallStatus::Connecting,
            CallStatus::Active,
            CallStatus::Ended,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_no_skipping_to_active_from_ringing() {
        assert!(!CallStatus::Requested.can_transition_to(CallStatus::Active));
        assert!(!CallStatus::Ringing.can_transition_to(CallStatus::Active));
    }

    #[test]
    fn test_reachability_spans_multiple_hops() {
        // Forward jumps over intermediate statuses are reachable
        assert!(CallStatus::Requested.can_reach(CallStatus::Active));
        assert!(CallStatus::Requested.can_reach(CallStatus::Missed));
        assert!(CallStatus::Ringing.can_reach(CallStatus::Connecting));

        // Regressions and sideways moves are not
        assert!(!CallStatus::Active.can_reach(CallStatus::Ringing));
        assert!(!CallStatus::Connecting.can_reach(CallStatus::Accepted));
        // Rejection is a pre-accept outcome only
        assert!(!CallStatus::Accepted.can_reach(CallStatus::Rejected));
        // Terminal statuses reach nothing
        assert!(!CallStatus::Ended.can_reach(CallStatus::Failed));
    }

    #[test]
    fn test_status_serde_shape() {
        let json = serde_json::to_string(&CallStatus::Requested).unwrap();
        assert_eq!(json, "\"requested\"");
        let reason = serde_json::to_string(&EndReason::CalleeRejected).unwrap();
        assert_eq!(reason, "\"callee_rejected\"");
    }
}
