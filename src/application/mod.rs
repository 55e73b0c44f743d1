//! Application layer - call orchestration

pub mod call_machine;
pub mod state;

pub use call_machine::{CallMachine, SessionContext};
pub use state::{CallPhase, CallSnapshot};
