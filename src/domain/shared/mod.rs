//! Shared kernel - common types used across the call core

pub mod error;
pub mod events;
pub mod result;
pub mod value_objects;

pub use error::CallError;
pub use result::Result;
pub use value_objects::*;
