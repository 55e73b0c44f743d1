//! Media session management - devices, peer connection, quality

pub mod backend;
pub mod manager;
pub mod peer;
pub mod quality;
pub mod stream;

pub use backend::{MediaBackend, MediaConstraints, SimulatedMediaBackend};
pub use manager::MediaSessionManager;
pub use peer::{PeerRole, PeerSession, PeerState};
pub use quality::{LinkStats, NetworkQuality};
pub use stream::{LocalStream, RemoteStream};
