//! Media session manager
//!
//! Owns the camera/microphone and the peer connection for exactly one call
//! attempt at a time. A second acquisition cannot start until the previous
//! attempt's teardown has run, so device locks are never leaked.

use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::AttemptId;
use crate::infrastructure::media::backend::{MediaBackend, MediaConstraints};
use crate::infrastructure::media::peer::{PeerRole, PeerSession};
use crate::infrastructure::media::quality::NetworkQuality;
use crate::infrastructure::media::stream::{LocalStream, RemoteStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct ActiveMedia {
    attempt: AttemptId,
    local: LocalStream,
    peer: Option<PeerSession>,
    remote: Option<RemoteStream>,
}

/// Exclusive owner of local media devices and the peer connection
pub struct MediaSessionManager {
    backend: Arc<dyn MediaBackend>,
    current: Mutex<Option<ActiveMedia>>,
    /// Autoplay/audio policies require a user gesture before device access
    user_gesture: AtomicBool,
    teardowns: AtomicU64,
}

impl MediaSessionManager {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            current: Mutex::new(None),
            user_gesture: AtomicBool::new(false),
            teardowns: AtomicU64::new(0),
        }
    }

    /// Record that a user gesture started this call flow
    pub fn mark_user_gesture(&self) {
        self.user_gesture.store(true, Ordering::SeqCst);
    }

    /// Request camera + microphone for a call attempt
    pub async fn acquire(
        &self,
        attempt: AttemptId,
        constraints: MediaConstraints,
    ) -> Result<LocalStream> {
        if !self.user_gesture.load(Ordering::SeqCst) {
            return Err(CallError::InvalidCallState(
                "media acquisition requires a user gesture".to_string(),
            ));
        }

        {
            let current = self.current.lock().await;
            if current.is_some() {
                warn!("media acquisition refused: previous attempt still holds devices");
                return Err(CallError::DeviceUnavailable(
                    "previous call attempt still holds the devices".to_string(),
                ));
            }
        }

        let local = self.backend.open_devices(constraints).await?;
        let mut current = self.current.lock().await;
        if current.is_some() {
            // Lost the race with another acquisition; release ours.
            local.stop();
            return Err(CallError::DeviceUnavailable(
                "previous call attempt still holds the devices".to_string(),
            ));
        }
        info!(%attempt, "local media acquired");
        *current = Some(ActiveMedia {
            attempt,
            local: local.clone(),
            peer: None,
            remote: None,
        });
        Ok(local)
    }

    /// Build the peer connection for the current attempt
    pub async fn create_peer(&self, attempt: AttemptId, role: PeerRole) -> Result<()> {
        let peer = self.backend.create_peer(role).await?;
        let mut current = self.current.lock().await;
        let active = Self::active_for(&mut current, attempt)?;
        active.peer = Some(peer);
        debug!(%attempt, ?role, "peer connection created");
        Ok(())
    }

    pub async fn create_offer(&self, attempt: AttemptId) -> Result<String> {
        let mut current = self.current.lock().await;
        let active = Self::active_for(&mut current, attempt)?;
        Self::peer_of(active)?.create_offer().await
    }

    pub async fn set_remote_offer(&self, attempt: AttemptId, sdp: String) -> Result<()> {
        let mut current = self.current.lock().await;
        let active = Self::active_for(&mut current, attempt)?;
        Self::peer_of(active)?.set_remote_offer(sdp).await
    }

    pub async fn create_answer(&self, attempt: AttemptId) -> Result<String> {
        let mut current = self.current.lock().await;
        let active = Self::active_for(&mut current, attempt)?;
        Self::peer_of(active)?.create_answer().await
    }

    /// Apply the remote answer; returns true when negotiation completed
    pub async fn set_remote_answer(&self, attempt: AttemptId, sdp: String) -> Result<bool> {
        let mut current = self.current.lock().await;
        let active = Self::active_for(&mut current, attempt)?;
        let peer = Self::peer_of(active)?;
        peer.set_remote_answer(sdp).await?;
        Ok(peer.is_connected())
    }

    pub async fn add_ice_candidate(&self, attempt: AttemptId, candidate: String) -> Result<()> {
        let mut current = self.current.lock().await;
        let active = Self::active_for(&mut current, attempt)?;
        Self::peer_of(active)?.add_ice_candidate(candidate).await
    }

    /// Negotiation is complete: populate and return the remote stream
    pub async fn complete(&self, attempt: AttemptId) -> Result<RemoteStream> {
        let mut current = self.current.lock().await;
        let active = Self::active_for(&mut current, attempt)?;
        let peer = Self::peer_of(active)?;
        if !peer.is_connected() {
            peer.mark_connected()?;
        }
        let remote = active.remote.get_or_insert_with(RemoteStream::new).clone();
        Ok(remote)
    }

    /// Flip the microphone track; returns the new muted state
    pub async fn toggle_mute(&self, attempt: AttemptId) -> Result<bool> {
        let mut current = self.current.lock().await;
        let active = Self::active_for(&mut current, attempt)?;
        Ok(active.local.toggle_audio())
    }

    /// Flip the camera track; returns the new video-off state
    pub async fn toggle_video(&self, attempt: AttemptId) -> Result<bool> {
        let mut current = self.current.lock().await;
        let active = Self::active_for(&mut current, attempt)?;
        Ok(active.local.toggle_video())
    }

    /// Sample connection statistics for the quality indicator
    pub async fn sample_quality(&self, attempt: AttemptId) -> Result<NetworkQuality> {
        {
            let mut current = self.current.lock().await;
            Self::active_for(&mut current, attempt)?;
        }
        let stats = self.backend.sample_stats().await?;
        Ok(NetworkQuality::from_stats(stats))
    }

    /// Stop all tracks, close the peer connection, release the devices.
    /// Runs at most once per attempt, and only for the attempt that holds
    /// them: a late continuation from a superseded attempt cannot release a
    /// successor's devices.
    pub async fn teardown(&self, attempt: AttemptId) {
        let mut current = self.current.lock().await;
        match current.take() {
            Some(mut active) if active.attempt == attempt => {
                active.local.stop();
                if let Some(remote) = &active.remote {
                    remote.stop();
                }
                if let Some(peer) = &mut active.peer {
                    peer.close();
                }
                self.teardowns.fetch_add(1, Ordering::SeqCst);
                info!(%attempt, "media session torn down");
            }
            holder => {
                if holder.is_some() {
                    debug!(%attempt, "stale teardown ignored");
                }
                *current = holder;
            }
        }
    }

    pub async fn has_active(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// How many teardowns have run (one per completed attempt)
    pub fn teardown_count(&self) -> u64 {
        self.teardowns.load(Ordering::SeqCst)
    }

    fn active_for<'a>(
        current: &'a mut Option<ActiveMedia>,
        attempt: AttemptId,
    ) -> Result<&'a mut ActiveMedia> {
        match current {
            Some(active) if active.attempt == attempt => Ok(active),
            _ => Err(CallError::InvalidCallState(format!(
                "no media session for {}",
                attempt
            ))),
        }
    }

    fn peer_of(active: &mut ActiveMedia) -> Result<&mut PeerSession> {
        active.peer.as_mut().ok_or_else(|| {
            CallError::NegotiationFailed("peer connection not created".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::backend::SimulatedMediaBackend;

    fn manager() -> MediaSessionManager {
        MediaSessionManager::new(Arc::new(SimulatedMediaBackend::new()))
    }

    #[tokio::test]
    async fn test_acquire_requires_gesture() {
        let mgr = manager();
        let err = mgr
            .acquire(AttemptId::initial(), MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidCallState(_)));
    }

    #[tokio::test]
    async fn test_exclusive_device_ownership() {
        let mgr = manager();
        mgr.mark_user_gesture();

        let first = AttemptId::initial();
        mgr.acquire(first, MediaConstraints::default()).await.unwrap();

        // Second attempt cannot acquire until teardown
        let second = first.next();
        let err = mgr
            .acquire(second, MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::DeviceUnavailable(_)));

        mgr.teardown(first).await;
        mgr.acquire(second, MediaConstraints::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let mgr = manager();
        mgr.mark_user_gesture();

        let attempt = AttemptId::initial();
        let local = mgr.acquire(attempt, MediaConstraints::default()).await.unwrap();

        mgr.teardown(attempt).await;
        mgr.teardown(attempt).await;
        mgr.teardown(attempt).await;

        assert!(local.is_stopped());
        assert_eq!(mgr.teardown_count(), 1);
        assert!(!mgr.has_active().await);
    }

    #[tokio::test]
    async fn test_stale_teardown_leaves_successor_alone() {
        let mgr = manager();
        mgr.mark_user_gesture();

        let first = AttemptId::initial();
        mgr.acquire(first, MediaConstraints::default()).await.unwrap();
        mgr.teardown(first).await;

        let second = first.next();
        let local = mgr.acquire(second, MediaConstraints::default()).await.unwrap();

        // A continuation of the abandoned first attempt fires late; the
        // successor's devices must survive it
        mgr.teardown(first).await;
        assert!(mgr.has_active().await);
        assert!(!local.is_stopped());
        assert_eq!(mgr.teardown_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_attempt_is_discarded() {
        let mgr = manager();
        mgr.mark_user_gesture();

        let attempt = AttemptId::initial();
        mgr.acquire(attempt, MediaConstraints::default()).await.unwrap();

        // A callback from a superseded attempt must not touch state
        let stale = attempt.next();
        assert!(mgr.toggle_mute(stale).await.is_err());
        assert!(mgr.create_peer(stale, PeerRole::Caller).await.is_err());
    }

    #[tokio::test]
    async fn test_full_negotiation_through_manager() {
        let caller_mgr = manager();
        let callee_mgr = manager();
        caller_mgr.mark_user_gesture();
        callee_mgr.mark_user_gesture();

        let a = AttemptId::initial();
        caller_mgr.acquire(a, MediaConstraints::default()).await.unwrap();
        callee_mgr.acquire(a, MediaConstraints::default()).await.unwrap();

        caller_mgr.create_peer(a, PeerRole::Caller).await.unwrap();
        callee_mgr.create_peer(a, PeerRole::Callee).await.unwrap();

        let offer = caller_mgr.create_offer(a).await.unwrap();
        callee_mgr.set_remote_offer(a, offer).await.unwrap();
        let answer = callee_mgr.create_answer(a).await.unwrap();
        let connected = caller_mgr.set_remote_answer(a, answer).await.unwrap();
        assert!(connected);

        let remote = caller_mgr.complete(a).await.unwrap();
        assert!(!remote.is_stopped());
        callee_mgr.complete(a).await.unwrap();
    }

    #[tokio::test]
    async fn test_toggles_flip_tracks() {
        let mgr = manager();
        mgr.mark_user_gesture();
        let attempt = AttemptId::initial();
        let local = mgr.acquire(attempt, MediaConstraints::default()).await.unwrap();

        assert!(mgr.toggle_mute(attempt).await.unwrap());
        assert!(!local.audio_enabled());
        assert!(mgr.toggle_video(attempt).await.unwrap());
        assert!(!local.video_enabled());
        assert!(!mgr.toggle_mute(attempt).await.unwrap());
        assert!(local.audio_enabled());
    }
}
