//! Nestline - call signaling and session state for a family calling app
//!
//! This is a Domain-Driven Design (DDD) implementation of the client-side
//! call core: a per-screen state machine driven by UI commands, signaling
//! channel messages, and the session store's update feed, with media
//! lifecycle handled through an attempt-scoped session manager.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::CallError;
pub use domain::shared::result::Result;
