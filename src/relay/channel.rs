//! A single relay channel
//!
//! Holds the broadcasters (keyed by user id) and the ordered listener list for
//! one channel id, and implements the fan-out rule for inbound frames.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use super::{ConnectionHandle, ConnectionId, Payload};

/// Errors produced while admitting a connection into a channel
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Broadcaster {user_id} already connected to channel {channel_id}")]
    DuplicateBroadcaster { user_id: String, channel_id: String },

    #[error("Channel {channel_id} exceeded max listeners limit ({max})")]
    CapacityExceeded { channel_id: String, max: usize },

    #[error("Relay is shutting down")]
    ShuttingDown,
}

/// Result type for channel operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Role a connection plays in its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Broadcaster,
    Listener,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Broadcaster => "broadcaster",
            Role::Listener => "listener",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A listener connection together with the user id it announced
#[derive(Debug, Clone)]
pub struct Listener {
    pub user_id: String,
    pub conn: ConnectionHandle,
}

/// Broadcasters and listeners sharing one channel id
#[derive(Debug)]
pub struct Channel {
    id: String,
    broadcasters: HashMap<String, ConnectionHandle>,
    listeners: Vec<Listener>,
    max_listeners: usize,
}

impl Channel {
    /// Create an empty channel
    pub fn new(id: impl Into<String>, max_listeners: usize) -> Self {
        Self {
            id: id.into(),
            broadcasters: HashMap::new(),
            listeners: Vec::new(),
            max_listeners,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn broadcaster_count(&self) -> usize {
        self.broadcasters.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    #[cfg(test)]
    pub fn has_broadcaster(&self, user_id: &str) -> bool {
        self.broadcasters.contains_key(user_id)
    }

    /// Connection currently registered as broadcaster for `user_id`
    #[cfg(test)]
    pub fn broadcaster(&self, user_id: &str) -> Option<&ConnectionHandle> {
        self.broadcasters.get(user_id)
    }

    /// Listeners in insertion order
    #[cfg(test)]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// True once there is neither a broadcaster nor a listener left
    pub fn is_empty(&self) -> bool {
        self.broadcasters.is_empty() && self.listeners.is_empty()
    }

    /// Register `conn` as the broadcaster for `user_id`
    ///
    /// An existing broadcaster with the same user id stays authoritative and
    /// the new connection is left untouched.
    pub fn register_broadcaster(
        &mut self,
        user_id: &str,
        conn: ConnectionHandle,
    ) -> RelayResult<()> {
        if self.broadcasters.contains_key(user_id) {
            return Err(RelayError::DuplicateBroadcaster {
                user_id: user_id.to_string(),
                channel_id: self.id.clone(),
            });
        }
        self.broadcasters.insert(user_id.to_string(), conn);
        Ok(())
    }

    /// Remove the broadcaster for `user_id` if it is still `conn_id`
    ///
    /// Returns whether an entry was removed.
    pub fn deregister_broadcaster(&mut self, user_id: &str, conn_id: ConnectionId) -> bool {
        match self.broadcasters.get(user_id) {
            Some(existing) if existing.id() == conn_id => {
                self.broadcasters.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Append a listener, then enforce the listener cap
    ///
    /// On `CapacityExceeded` the listener has been appended and its connection
    /// closed; the connection's close path is expected to deregister it.
    pub fn register_listener(&mut self, user_id: &str, conn: ConnectionHandle) -> RelayResult<()> {
        self.listeners.push(Listener {
            user_id: user_id.to_string(),
            conn,
        });

        if self.capacity_check().is_some() {
            return Err(RelayError::CapacityExceeded {
                channel_id: self.id.clone(),
                max: self.max_listeners,
            });
        }
        Ok(())
    }

    /// Remove the listener entry for `conn_id`
    pub fn deregister_listener(&mut self, conn_id: ConnectionId) -> bool {
        match self.listeners.iter().position(|l| l.conn.id() == conn_id) {
            Some(index) => {
                self.listeners.remove(index);
                true
            }
            None => false,
        }
    }

    /// Close the most recently added listener if the cap is exceeded
    ///
    /// Returns the evicted connection. The entry stays in the list until its
    /// close path calls `deregister_listener`.
    pub fn capacity_check(&self) -> Option<&ConnectionHandle> {
        if self.listeners.len() <= self.max_listeners {
            return None;
        }
        let newest = &self.listeners.last()?.conn;
        warn!(
            "Channel {} exceeded max listeners limit ({}), dropping {}",
            self.id,
            self.max_listeners,
            newest.peer()
        );
        newest.close();
        Some(newest)
    }

    /// Send `frame` to every listener whose user id differs from `from_user_id`
    ///
    /// Delivery is best effort: a failed send is skipped. Returns the number
    /// of listeners the frame was queued for.
    pub fn forward_frame(&self, from_user_id: &str, frame: &Payload) -> usize {
        let mut delivered = 0;
        for listener in self.listeners.iter().filter(|l| l.user_id != from_user_id) {
            match listener.conn.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Dropping frame for {}: {}", listener.user_id, e),
            }
        }
        delivered
    }

    /// Every connection in this channel, broadcasters first
    pub fn connections(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.broadcasters
            .values()
            .chain(self.listeners.iter().map(|l| &l.conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn conn() -> (ConnectionHandle, UnboundedReceiver<Outbound>) {
        ConnectionHandle::new("test")
    }

    fn frame() -> Payload {
        Payload::Binary(vec![0xDE, 0xAD, 0xBE, 0xEF])
    }

    #[test]
    fn test_new_channel_is_empty() {
        let channel = Channel::new("room1", 10);
        assert!(channel.is_empty());
        assert_eq!(channel.id(), "room1");
    }

    #[test]
    fn test_duplicate_broadcaster_rejected() {
        let mut channel = Channel::new("room1", 10);
        let (first, _rx1) = conn();
        let (second, mut rx2) = conn();

        channel.register_broadcaster("b1", first.clone()).unwrap();
        let result = channel.register_broadcaster("b1", second.clone());

        assert_eq!(
            result,
            Err(RelayError::DuplicateBroadcaster {
                user_id: "b1".to_string(),
                channel_id: "room1".to_string(),
            })
        );
        assert_eq!(channel.broadcaster_count(), 1);
        assert_eq!(channel.broadcaster("b1").unwrap().id(), first.id());
        // The duplicate is neither closed nor sent anything
        assert!(!second.is_closed());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_distinct_broadcasters_coexist() {
        let mut channel = Channel::new("room1", 10);
        let (a, _rxa) = conn();
        let (b, _rxb) = conn();
        channel.register_broadcaster("a", a).unwrap();
        channel.register_broadcaster("b", b).unwrap();
        assert_eq!(channel.broadcaster_count(), 2);
    }

    #[test]
    fn test_deregister_broadcaster_requires_matching_connection() {
        let mut channel = Channel::new("room1", 10);
        let (first, _rx1) = conn();
        let (other, _rx2) = conn();
        channel.register_broadcaster("b1", first.clone()).unwrap();

        assert!(!channel.deregister_broadcaster("b1", other.id()));
        assert!(channel.has_broadcaster("b1"));

        assert!(channel.deregister_broadcaster("b1", first.id()));
        assert!(channel.is_empty());
    }

    #[test]
    fn test_listeners_may_share_user_id() {
        let mut channel = Channel::new("room1", 10);
        let (a, _rxa) = conn();
        let (b, _rxb) = conn();
        channel.register_listener("l1", a).unwrap();
        channel.register_listener("l1", b).unwrap();
        assert_eq!(channel.listener_count(), 2);
    }

    #[test]
    fn test_deregister_listener_removes_only_that_connection() {
        let mut channel = Channel::new("room1", 10);
        let (a, _rxa) = conn();
        let (b, _rxb) = conn();
        channel.register_listener("l1", a.clone()).unwrap();
        channel.register_listener("l1", b.clone()).unwrap();

        assert!(channel.deregister_listener(a.id()));
        assert!(!channel.deregister_listener(a.id()));
        assert_eq!(channel.listener_count(), 1);
        assert_eq!(channel.listeners()[0].conn.id(), b.id());
    }

    #[test]
    fn test_capacity_evicts_newest_listener() {
        let mut channel = Channel::new("room1", 2);
        let (l1, _rx1) = conn();
        let (l2, _rx2) = conn();
        let (l3, mut rx3) = conn();

        channel.register_listener("l1", l1.clone()).unwrap();
        channel.register_listener("l2", l2.clone()).unwrap();
        let result = channel.register_listener("l3", l3.clone());

        assert_eq!(
            result,
            Err(RelayError::CapacityExceeded {
                channel_id: "room1".to_string(),
                max: 2,
            })
        );
        assert!(l3.is_closed());
        assert!(!l1.is_closed());
        assert!(!l2.is_closed());
        assert_eq!(rx3.try_recv().unwrap(), Outbound::Close);

        // The close path removes the evicted entry
        channel.deregister_listener(l3.id());
        assert_eq!(channel.listener_count(), 2);
    }

    #[test]
    fn test_capacity_check_within_limit() {
        let mut channel = Channel::new("room1", 1);
        let (l1, _rx1) = conn();
        channel.register_listener("l1", l1.clone()).unwrap();
        assert!(channel.capacity_check().is_none());
        assert!(!l1.is_closed());
    }

    #[test]
    fn test_forward_frame_reaches_every_listener() {
        let mut channel = Channel::new("room1", 10);
        let (b1, mut rxb) = conn();
        let (l1, mut rx1) = conn();
        let (l2, mut rx2) = conn();
        channel.register_broadcaster("b1", b1).unwrap();
        channel.register_listener("l1", l1).unwrap();
        channel.register_listener("l2", l2).unwrap();

        assert_eq!(channel.forward_frame("b1", &frame()), 2);

        assert_eq!(rx1.try_recv().unwrap(), Outbound::Payload(frame()));
        assert_eq!(rx2.try_recv().unwrap(), Outbound::Payload(frame()));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
        assert!(rxb.try_recv().is_err());
    }

    #[test]
    fn test_forward_frame_skips_same_user_id() {
        let mut channel = Channel::new("room1", 10);
        let (echo, mut rx_echo) = conn();
        let (other, mut rx_other) = conn();
        channel.register_listener("b1", echo).unwrap();
        channel.register_listener("l1", other).unwrap();

        assert_eq!(channel.forward_frame("b1", &frame()), 1);
        assert!(rx_echo.try_recv().is_err());
        assert_eq!(rx_other.try_recv().unwrap(), Outbound::Payload(frame()));
    }

    #[test]
    fn test_forward_frame_survives_failed_send() {
        let mut channel = Channel::new("room1", 10);
        let (dead, _rx_dead) = conn();
        let (alive, mut rx_alive) = conn();
        dead.close();
        channel.register_listener("l1", dead).unwrap();
        channel.register_listener("l2", alive).unwrap();

        assert_eq!(channel.forward_frame("b1", &frame()), 1);
        assert_eq!(rx_alive.try_recv().unwrap(), Outbound::Payload(frame()));
    }

    #[test]
    fn test_connections_lists_everyone() {
        let mut channel = Channel::new("room1", 10);
        let (b1, _rxb) = conn();
        let (l1, _rx1) = conn();
        channel.register_broadcaster("b1", b1).unwrap();
        channel.register_listener("l1", l1).unwrap();
        assert_eq!(channel.connections().count(), 2);
    }
}
