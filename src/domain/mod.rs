//! Domain layer - entities, value objects, and business rules

pub mod glare;
pub mod presence;
pub mod session;
pub mod shared;

pub use session::{CallSession, CallStatus, EndReason, Participant, Role};
pub use shared::{CallError, Result};
