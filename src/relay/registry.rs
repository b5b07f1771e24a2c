//! Channel registry
//!
//! Maps channel ids to channels. Channels are created on first reference and
//! removed as soon as they hold no connections.

use std::collections::HashMap;

use tracing::info;

use super::Channel;

/// Registry of live channels
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
    max_listeners: usize,
}

impl ChannelRegistry {
    /// Create an empty registry whose channels cap listeners at `max_listeners`
    pub fn new(max_listeners: usize) -> Self {
        Self {
            channels: HashMap::new(),
            max_listeners,
        }
    }

    /// Return the channel for `channel_id`, creating it if needed
    pub fn get_or_create(&mut self, channel_id: &str) -> &mut Channel {
        let max_listeners = self.max_listeners;
        self.channels
            .entry(channel_id.to_string())
            .or_insert_with(|| Channel::new(channel_id, max_listeners))
    }

    pub fn get(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.get(channel_id)
    }

    pub fn get_mut(&mut self, channel_id: &str) -> Option<&mut Channel> {
        self.channels.get_mut(channel_id)
    }

    /// Drop the channel if it no longer holds any connection
    ///
    /// Returns whether the channel was removed.
    pub fn remove_if_empty(&mut self, channel_id: &str) -> bool {
        let empty = self
            .channels
            .get(channel_id)
            .is_some_and(|channel| channel.is_empty());
        if empty {
            self.channels.remove(channel_id);
            info!("Channel {} is empty, removing it", channel_id);
        }
        empty
    }

    #[cfg(test)]
    pub fn contains(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Remove and return every channel
    pub fn drain(&mut self) -> Vec<Channel> {
        self.channels.drain().map(|(_, channel)| channel).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ConnectionHandle;

    #[test]
    fn test_get_or_create_is_lazy() {
        let mut registry = ChannelRegistry::new(10);
        assert!(!registry.contains("room1"));

        registry.get_or_create("room1");
        assert!(registry.contains("room1"));
        assert_eq!(registry.len(), 1);

        // Second lookup returns the same channel
        let (conn, _rx) = ConnectionHandle::new("test");
        registry
            .get_or_create("room1")
            .register_listener("l1", conn)
            .unwrap();
        assert_eq!(registry.get_or_create("room1").listener_count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_channels_inherit_listener_cap() {
        let mut registry = ChannelRegistry::new(1);
        let (a, _rxa) = ConnectionHandle::new("a");
        let (b, _rxb) = ConnectionHandle::new("b");
        let channel = registry.get_or_create("room1");
        channel.register_listener("a", a).unwrap();
        assert!(channel.register_listener("b", b.clone()).is_err());
        assert!(b.is_closed());
    }

    #[test]
    fn test_remove_if_empty_keeps_occupied_channel() {
        let mut registry = ChannelRegistry::new(10);
        let (conn, _rx) = ConnectionHandle::new("test");
        registry
            .get_or_create("room1")
            .register_broadcaster("b1", conn)
            .unwrap();

        assert!(!registry.remove_if_empty("room1"));
        assert!(registry.contains("room1"));
    }

    #[test]
    fn test_remove_if_empty_after_last_removal() {
        let mut registry = ChannelRegistry::new(10);
        let (conn, _rx) = ConnectionHandle::new("test");
        let conn_id = conn.id();
        registry
            .get_or_create("room1")
            .register_broadcaster("b1", conn)
            .unwrap();

        registry
            .get_mut("room1")
            .unwrap()
            .deregister_broadcaster("b1", conn_id);
        assert!(registry.remove_if_empty("room1"));
        assert!(!registry.contains("room1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_if_empty_unknown_channel() {
        let mut registry = ChannelRegistry::new(10);
        assert!(!registry.remove_if_empty("missing"));
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = ChannelRegistry::new(10);
        registry.get_or_create("a");
        registry.get_or_create("b");
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
