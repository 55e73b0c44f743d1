//! Local and remote media stream handles
//!
//! The call machine and the UI hold these as cheap clones; the underlying
//! tracks are owned by the media session for exactly one call attempt.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Local camera + microphone stream
#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<StreamInner>,
}

/// Remote participant's stream, populated when the first remote track arrives
#[derive(Clone)]
pub struct RemoteStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: Uuid,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    stopped: AtomicBool,
}

impl StreamInner {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl LocalStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StreamInner::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Flip the audio track's enabled flag; returns the new muted state
    pub fn toggle_audio(&self) -> bool {
        let was_enabled = self.inner.audio_enabled.fetch_xor(true, Ordering::SeqCst);
        was_enabled
    }

    /// Flip the video track's enabled flag; returns the new video-off state
    pub fn toggle_video(&self) -> bool {
        let was_enabled = self.inner.video_enabled.fetch_xor(true, Ordering::SeqCst);
        was_enabled
    }

    pub fn audio_enabled(&self) -> bool {
        self.inner.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.inner.video_enabled.load(Ordering::SeqCst)
    }

    /// Stop all tracks, releasing the camera/microphone lock. Idempotent.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl Default for LocalStream {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StreamInner::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl Default for RemoteStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.inner.id)
            .field("audio_enabled", &self.audio_enabled())
            .field("video_enabled", &self.video_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.inner.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
