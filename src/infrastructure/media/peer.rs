//! Peer connection negotiation
//!
//! A small offer/answer state machine. SDP bodies are opaque to the call
//! machine; the simulated substrate generates just enough of one to exercise
//! the exchange.

use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use tracing::{debug, info};
use uuid::Uuid;

/// Which side of the negotiation this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Creates the offer
    Caller,
    /// Answers the offer
    Callee,
}

/// Peer connection negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Offering,
    OfferReceived,
    Answering,
    Connected,
    Closed,
}

/// Peer connection for one call attempt
pub struct PeerSession {
    peer_id: Uuid,
    role: PeerRole,
    state: PeerState,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    remote_candidates: Vec<String>,
}

impl PeerSession {
    pub fn new(role: PeerRole) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            role,
            state: PeerState::New,
            local_sdp: None,
            remote_sdp: None,
            remote_candidates: Vec::new(),
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Create the local offer
    pub async fn create_offer(&mut self) -> Result<String> {
        if self.role != PeerRole::Caller {
            return Err(CallError::NegotiationFailed(
                "only the calling side creates offers".to_string(),
            ));
        }
        if self.state != PeerState::New {
            return Err(CallError::NegotiationFailed(format!(
                "cannot create offer in state {:?}",
                self.state
            )));
        }

        let sdp = build_sdp("offer", self.peer_id);
        self.local_sdp = Some(sdp.clone());
        self.state = PeerState::Offering;
        info!(peer = %self.peer_id, "created offer");
        Ok(sdp)
    }

    /// Apply the remote offer
    pub async fn set_remote_offer(&mut self, sdp: String) -> Result<()> {
        if self.state != PeerState::New {
            return Err(CallError::NegotiationFailed(format!(
                "cannot apply remote offer in state {:?}",
                self.state
            )));
        }
        self.remote_sdp = Some(sdp);
        self.state = PeerState::OfferReceived;
        debug!(peer = %self.peer_id, "applied remote offer");
        Ok(())
    }

    /// Answer the remote offer
    pub async fn create_answer(&mut self) -> Result<String> {
        if self.state != PeerState::OfferReceived {
            return Err(CallError::NegotiationFailed(
                "no offer to answer".to_string(),
            ));
        }

        let sdp = build_sdp("answer", self.peer_id);
        self.local_sdp = Some(sdp.clone());
        self.state = PeerState::Answering;
        info!(peer = %self.peer_id, "created answer");
        Ok(sdp)
    }

    /// Apply the remote answer; completes negotiation on the offering side
    pub async fn set_remote_answer(&mut self, sdp: String) -> Result<()> {
        if self.state != PeerState::Offering {
            return Err(CallError::NegotiationFailed(
                "not waiting for an answer".to_string(),
            ));
        }
        self.remote_sdp = Some(sdp);
        self.state = PeerState::Connected;
        info!(peer = %self.peer_id, "negotiation complete");
        Ok(())
    }

    /// Apply a trickled ICE candidate. Tolerated in any live state since
    /// candidates may arrive out of order with the offer/answer exchange.
    pub async fn add_ice_candidate(&mut self, candidate: String) -> Result<()> {
        if self.state == PeerState::Closed {
            return Err(CallError::NegotiationFailed(
                "peer connection closed".to_string(),
            ));
        }
        debug!(peer = %self.peer_id, %candidate, "applied ICE candidate");
        self.remote_candidates.push(candidate);
        Ok(())
    }

    /// Mark the answering side connected once the active row confirms the
    /// offerer completed negotiation.
    pub fn mark_connected(&mut self) -> Result<()> {
        match self.state {
            PeerState::Answering | PeerState::Connected => {
                self.state = PeerState::Connected;
                Ok(())
            }
            other => Err(CallError::NegotiationFailed(format!(
                "cannot mark connected from {:?}",
                other
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Close the connection. Idempotent.
    pub fn close(&mut self) {
        if self.state != PeerState::Closed {
            self.state = PeerState::Closed;
            debug!(peer = %self.peer_id, "peer connection closed");
        }
    }
}

fn build_sdp(kind: &str, peer_id: Uuid) -> String {
    let ufrag: String = peer_id.to_string().chars().take(8).collect();
    format!(
        "v=0\r\no=- {} 0 IN IP4 0.0.0.0\r\ns={}\r\nt=0 0\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=ice-ufrag:{}\r\n\
         m=video 9 UDP/TLS/RTP/SAVPF 96\r\n",
        peer_id.as_simple(),
        kind,
        ufrag
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_answer_flow() {
        let mut caller = PeerSession::new(PeerRole::Caller);
        let mut callee = PeerSession::new(PeerRole::Callee);

        let offer = caller.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        assert_eq!(caller.state(), PeerState::Offering);

        callee.set_remote_offer(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(callee.state(), PeerState::Answering);

        caller.set_remote_answer(answer).await.unwrap();
        assert!(caller.is_connected());

        callee.mark_connected().unwrap();
        assert!(callee.is_connected());
    }

    #[tokio::test]
    async fn test_callee_cannot_offer() {
        let mut callee = PeerSession::new(PeerRole::Callee);
        assert!(callee.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn test_answer_requires_offer() {
        let mut callee = PeerSession::new(PeerRole::Callee);
        assert!(callee.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_candidates_tolerated_before_answer() {
        let mut caller = PeerSession::new(PeerRole::Caller);
        caller.create_offer().await.unwrap();
        caller
            .add_ice_candidate("candidate:0 1 UDP 1 192.0.2.1 3478 typ host".to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_rejects_candidates() {
        let mut caller = PeerSession::new(PeerRole::Caller);
        caller.close();
        caller.close();
        assert!(caller.add_ice_candidate("candidate:0".to_string()).await.is_err());
    }
}
