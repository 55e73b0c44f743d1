//! Call-core errors

use thiserror::Error;

/// Call-core result type
pub type Result<T> = std::result::Result<T, CallError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Camera/microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Peer negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Signaling channel unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Invalid call state: {0}")]
    InvalidCallState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Participant offline: {0}")]
    PeerOffline(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Whether the UI should present this as an actionable device problem
    /// rather than a generic call failure.
    pub fn is_device_problem(&self) -> bool {
        matches!(
            self,
            CallError::PermissionDenied(_) | CallError::DeviceUnavailable(_)
        )
    }
}
