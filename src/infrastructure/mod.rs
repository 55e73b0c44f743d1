//! Infrastructure layer - adapters for signaling, media, and persistence

pub mod media;
pub mod persistence;
pub mod signaling;
