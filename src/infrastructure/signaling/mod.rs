//! Signaling channel - per-call publish/subscribe message delivery

pub mod hub;
pub mod message;

pub use hub::{InProcessSignaling, SignalingHandle, SignalingTransport};
pub use message::{channel_name, LifecycleNotice, SignalEnvelope, SignalPayload};
