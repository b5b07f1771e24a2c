//! Channel registry and fan-out engine
//!
//! Tracks which connections broadcast or listen on each channel and relays
//! broadcaster frames to listeners.

mod channel;
mod connection;
mod engine;
mod registry;

pub use channel::*;
pub use connection::*;
pub use engine::*;
pub use registry::*;
