//! In-process signaling transport
//!
//! One broadcast channel per call. Delivery is best-effort: messages sent
//! before a subscriber attaches, or past a lagged receiver, are lost. The
//! call machine tolerates duplicates and loss; it never relies on the
//! channel for lifecycle truth.

use crate::domain::shared::error::CallError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::CallId;
use crate::infrastructure::signaling::message::{channel_name, SignalEnvelope};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Handle to one call's signaling channel, good for the call's lifetime
#[derive(Debug, Clone)]
pub struct SignalingHandle {
    call_id: CallId,
    tx: broadcast::Sender<SignalEnvelope>,
}

impl SignalingHandle {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn channel_name(&self) -> String {
        channel_name(self.call_id)
    }

    /// Fire-and-forget send. Delivery is not guaranteed.
    pub fn send(&self, envelope: SignalEnvelope) {
        debug!(
            channel = %self.channel_name(),
            sender = %envelope.sender_id,
            "sending signaling message"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to messages in arrival order
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEnvelope> {
        self.tx.subscribe()
    }
}

/// Per-call publish/subscribe signaling transport
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open (or re-open) the channel for a call. Idempotent.
    async fn open(&self, call_id: CallId) -> Result<SignalingHandle>;

    /// Release the channel. Safe to call multiple times.
    async fn close(&self, call_id: CallId);
}

/// In-process transport backed by tokio broadcast channels. Stands in for
/// the external realtime-broadcast collaborator in the demo and tests.
pub struct InProcessSignaling {
    channels: RwLock<HashMap<CallId, broadcast::Sender<SignalEnvelope>>>,
    /// Simulated outage: `open` fails while set, which pushes consumers
    /// onto the fallback poll.
    unavailable: AtomicBool,
}

impl InProcessSignaling {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate the realtime collaborator going down or coming back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for InProcessSignaling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingTransport for InProcessSignaling {
    async fn open(&self, call_id: CallId) -> Result<SignalingHandle> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CallError::SignalingUnavailable(format!(
                "subscription to {} failed",
                channel_name(call_id)
            )));
        }

        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(call_id)
            .or_insert_with(|| {
                debug!(channel = %channel_name(call_id), "opening signaling channel");
                broadcast::channel(CHANNEL_CAPACITY).0
            })
            .clone();

        Ok(SignalingHandle { call_id, tx })
    }

    async fn close(&self, call_id: CallId) {
        let mut channels = self.channels.write().await;
        if channels.remove(&call_id).is_some() {
            debug!(channel = %channel_name(call_id), "closed signaling channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::value_objects::ParticipantId;
    use crate::infrastructure::signaling::message::{LifecycleNotice, SignalPayload};

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let hub = InProcessSignaling::new();
        let call_id = CallId::new();

        let a = hub.open(call_id).await.unwrap();
        let b = hub.open(call_id).await.unwrap();
        assert_eq!(hub.channel_count().await, 1);

        // Both handles reach the same subscribers
        let mut rx = b.subscribe();
        a.send(SignalEnvelope::new(
            call_id,
            ParticipantId::new(),
            SignalPayload::Lifecycle {
                notice: LifecycleNotice::Requested,
            },
        ));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.call_id, call_id);
    }

    #[tokio::test]
    async fn test_close_is_safe_to_repeat() {
        let hub = InProcessSignaling::new();
        let call_id = CallId::new();
        hub.open(call_id).await.unwrap();

        hub.close(call_id).await;
        hub.close(call_id).await;
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_without_subscriber_is_lossy_not_fatal() {
        let hub = InProcessSignaling::new();
        let call_id = CallId::new();
        let handle = hub.open(call_id).await.unwrap();

        // No subscriber yet; the message is dropped silently.
        handle.send(SignalEnvelope::new(
            call_id,
            ParticipantId::new(),
            SignalPayload::Control {
                muted: true,
                video_off: false,
            },
        ));
    }

    #[tokio::test]
    async fn test_outage_surfaces_signaling_unavailable() {
        let hub = InProcessSignaling::new();
        hub.set_unavailable(true);

        let err = hub.open(CallId::new()).await.unwrap_err();
        assert!(matches!(err, CallError::SignalingUnavailable(_)));

        hub.set_unavailable(false);
        assert!(hub.open(CallId::new()).await.is_ok());
    }
}
