//! Relay server module
//!
//! Accepts WebSocket or raw TCP connections, decodes handshakes and drives
//! each connection's session against the relay engine.

mod handler;
mod protocol;
mod tcp;
mod websocket;

pub use handler::*;
pub use protocol::*;
pub use websocket::*;
