//! Call session bounded context - the durable record of a call attempt

pub mod aggregate;
pub mod entity;
pub mod event;
pub mod repository;
pub mod value_object;

pub use aggregate::{CallSession, PairKey};
pub use entity::Participant;
pub use event::{SessionEvent, SessionEventKind};
pub use repository::{InsertOutcome, SessionStore};
pub use value_object::{CallStatus, EndReason, Role};
