//! Interface layer - the surface the UI programs against

pub mod call_screen;
pub mod poll;

pub use call_screen::CallScreenHandle;
pub use poll::FallbackPoller;
