//! Transport-agnostic connection handle
//!
//! A `ConnectionHandle` is the only thing the relay core knows about a socket.
//! Frames pushed into it are queued on an unbounded channel and written out by
//! the transport's writer task, so sending never blocks the caller.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Unique identifier of a single accepted connection
pub type ConnectionId = Uuid;

/// A payload received from or sent to a connection
///
/// The tag is set by the transport that produced the payload; nothing
/// downstream inspects the bytes to guess which kind it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Control line (handshake, shutdown notice)
    Text(String),
    /// Opaque audio frame
    Binary(Vec<u8>),
}

impl Payload {
    /// Length of the payload in bytes
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(data) => data.len(),
        }
    }
}

/// Items consumed by a transport's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write a payload to the peer
    Payload(Payload),
    /// Close the connection after everything queued before it
    Close,
}

/// Errors raised when talking to a connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
}

struct Inner {
    id: ConnectionId,
    peer: String,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: watch::Sender<bool>,
}

/// Handle to one accepted connection
///
/// Clones share the same underlying connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task should drain
    pub fn new(peer: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                peer: peer.into(),
                tx,
                closed,
            }),
        };
        (handle, rx)
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Peer label used in logs
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Queue a payload for delivery
    pub fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.id()));
        }
        self.inner
            .tx
            .send(Outbound::Payload(payload))
            .map_err(|_| TransportError::Closed(self.id()))
    }

    /// Close the connection
    ///
    /// Only the first call has any effect.
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        let _ = self.inner.tx.send(Outbound::Close);
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        // The sender lives in `self`, so this only ends when the flag flips.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
