//! Media device and peer-connection substrate
//!
//! The platform media stack (getUserMedia, RTCPeerConnection equivalents)
//! sits behind this port. The simulated backend stands in for it in the demo
//! and tests, with injectable failures for the denial and outage paths.

use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::infrastructure::media::peer::{PeerRole, PeerSession};
use crate::infrastructure::media::quality::LinkStats;
use crate::infrastructure::media::stream::LocalStream;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// What to request from the devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Platform media substrate
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Request camera + microphone access
    async fn open_devices(&self, constraints: MediaConstraints) -> Result<LocalStream>;

    /// Build a peer connection for one side of a call
    async fn create_peer(&self, role: PeerRole) -> Result<PeerSession>;

    /// Sample current connection statistics
    async fn sample_stats(&self) -> Result<LinkStats>;
}

/// In-process media substrate with injectable failures
pub struct SimulatedMediaBackend {
    deny_permission: AtomicBool,
    no_device: AtomicBool,
    fail_negotiation: AtomicBool,
    device_delay_ms: AtomicU64,
    stats: Mutex<LinkStats>,
}

impl SimulatedMediaBackend {
    pub fn new() -> Self {
        Self {
            deny_permission: AtomicBool::new(false),
            no_device: AtomicBool::new(false),
            fail_negotiation: AtomicBool::new(false),
            device_delay_ms: AtomicU64::new(0),
            stats: Mutex::new(LinkStats::default()),
        }
    }

    /// Simulate the user denying the camera/microphone prompt
    pub fn deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::SeqCst);
    }

    /// Simulate no capture device being present
    pub fn set_no_device(&self, missing: bool) {
        self.no_device.store(missing, Ordering::SeqCst);
    }

    /// Simulate peer connection construction failing
    pub fn fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    /// Simulate slow device startup, e.g. a camera that takes a while to warm up
    pub fn set_device_delay(&self, delay: std::time::Duration) {
        self.device_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Set the baseline link statistics reported by `sample_stats`
    pub fn set_stats(&self, stats: LinkStats) {
        *self.stats.lock().unwrap() = stats;
    }
}

impl Default for SimulatedMediaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaBackend for SimulatedMediaBackend {
    async fn open_devices(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        let delay = self.device_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(CallError::PermissionDenied(
                "user denied camera/microphone access".to_string(),
            ));
        }
        if self.no_device.load(Ordering::SeqCst) {
            return Err(CallError::DeviceUnavailable(
                "no capture device present".to_string(),
            ));
        }

        let stream = LocalStream::new();
        if !constraints.audio {
            stream.toggle_audio();
        }
        if !constraints.video {
            stream.toggle_video();
        }
        Ok(stream)
    }

    async fn create_peer(&self, role: PeerRole) -> Result<PeerSession> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(CallError::NegotiationFailed(
                "peer connection construction failed".to_string(),
            ));
        }
        Ok(PeerSession::new(role))
    }

    async fn sample_stats(&self) -> Result<LinkStats> {
        let base = *self.stats.lock().unwrap();
        // Jitter the baseline so successive samples look like a real link
        let mut rng = rand::thread_rng();
        Ok(LinkStats {
            packet_loss_percent: (base.packet_loss_percent + rng.gen_range(-0.2..0.2)).max(0.0),
            rtt_ms: (base.rtt_ms + rng.gen_range(-5.0..5.0)).max(1.0),
        })
    }
}
