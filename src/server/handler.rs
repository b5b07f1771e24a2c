//! Per-connection session
//!
//! Drives one connection through `Unclassified -> Broadcaster | Listener ->
//! Closed`. Transports feed it payloads and lifecycle events; it talks to the
//! relay engine and never touches the socket directly.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::protocol::Handshake;
use crate::relay::{ConnectionHandle, Payload, RelayEngine, RelayError, Role};

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no valid handshake yet
    Unclassified,
    /// Sending frames into `channel_id`
    Broadcaster { user_id: String, channel_id: String },
    /// Receiving frames from `channel_id`
    Listener { user_id: String, channel_id: String },
    /// Terminal
    Closed,
}

impl SessionState {
    fn classified(handshake: Handshake) -> Self {
        match handshake.role {
            Role::Broadcaster => SessionState::Broadcaster {
                user_id: handshake.user_id,
                channel_id: handshake.channel_id,
            },
            Role::Listener => SessionState::Listener {
                user_id: handshake.user_id,
                channel_id: handshake.channel_id,
            },
        }
    }
}

/// Session state machine for a single connection
pub struct Session {
    conn: ConnectionHandle,
    engine: Arc<RelayEngine>,
    state: SessionState,
}

impl Session {
    /// Create a session for a freshly accepted connection
    pub fn new(conn: ConnectionHandle, engine: Arc<RelayEngine>) -> Self {
        Self {
            conn,
            engine,
            state: SessionState::Unclassified,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[cfg(test)]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// Whether the next payload is read as a handshake
    pub fn awaiting_handshake(&self) -> bool {
        self.state == SessionState::Unclassified
    }

    /// Handle a payload received from the peer
    pub async fn on_payload(&mut self, payload: Payload) {
        if self.awaiting_handshake() {
            self.on_handshake(payload).await;
            return;
        }

        match &self.state {
            SessionState::Broadcaster {
                user_id,
                channel_id,
            } => {
                self.engine.forward(channel_id, user_id, &payload).await;
            }
            SessionState::Listener { user_id, .. } => {
                debug!(
                    "Ignoring {} byte payload from listener {}",
                    payload.len(),
                    user_id
                );
            }
            SessionState::Unclassified | SessionState::Closed => {}
        }
    }

    async fn on_handshake(&mut self, payload: Payload) {
        let handshake = match Handshake::decode(&payload) {
            Ok(handshake) => handshake,
            Err(e) => {
                debug!("Discarding payload from {}: {}", self.conn.peer(), e);
                return;
            }
        };
        info!("Handshake from {}: {}", self.conn.peer(), handshake);

        let result = self
            .engine
            .register(
                &handshake.user_id,
                &handshake.channel_id,
                handshake.role,
                &self.conn,
            )
            .await;
        match result {
            Ok(()) | Err(RelayError::CapacityExceeded { .. }) => {
                // An evicted listener is registered and already closed; its
                // close path deregisters it.
                self.state = SessionState::classified(handshake);
            }
            Err(RelayError::DuplicateBroadcaster { .. }) => {}
            Err(RelayError::ShuttingDown) => {
                // Never registered, and the engine already closed the socket.
                self.state = SessionState::Closed;
            }
        }
    }

    /// Handle a transport error: force-close, then tear down
    pub async fn on_error(&mut self, err: impl fmt::Display) {
        warn!("Connection error for {}: {}", self.describe(), err);
        self.conn.close();
        self.on_close().await;
    }

    /// Handle the connection closing; deregisters at most once
    pub async fn on_close(&mut self) {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Broadcaster {
                user_id,
                channel_id,
            } => {
                self.engine
                    .deregister_broadcaster(&channel_id, &user_id, self.conn.id())
                    .await;
            }
            SessionState::Listener {
                user_id,
                channel_id,
            } => {
                self.engine
                    .deregister_listener(&channel_id, &user_id, self.conn.id())
                    .await;
            }
            SessionState::Unclassified | SessionState::Closed => {}
        }
    }

    fn describe(&self) -> String {
        match &self.state {
            SessionState::Broadcaster { user_id, .. } | SessionState::Listener { user_id, .. } => {
                user_id.clone()
            }
            _ => format!("unknown user ({})", self.conn.peer()),
        }
    }
}
