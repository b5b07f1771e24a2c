//! Relay engine
//!
//! Owns the channel registry and is the single entry point for every
//! registration, deregistration, fan-out and shutdown step. All of them run
//! under one registry lock, so no two mutations of a channel interleave.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ChannelRegistry, ConnectionHandle, ConnectionId, Payload, RelayError, RelayResult, Role,
};

/// Notice sent to every connection before a graceful shutdown
pub const DEFAULT_SHUTDOWN_NOTICE: &str = "Server is shutting down...";

/// Coordinates channels for all connections of one relay process
pub struct RelayEngine {
    /// Channel registry, injected at construction
    registry: Mutex<ChannelRegistry>,
    /// Text sent to every connection before shutdown closes it
    shutdown_notice: String,
    /// Set under the registry lock once shutdown has drained the registry
    shut_down: AtomicBool,
}

impl RelayEngine {
    /// Create an engine around `registry`
    pub fn new(registry: ChannelRegistry) -> Self {
        Self {
            registry: Mutex::new(registry),
            shutdown_notice: DEFAULT_SHUTDOWN_NOTICE.to_string(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Set the shutdown notice
    pub fn with_shutdown_notice(mut self, notice: impl Into<String>) -> Self {
        self.shutdown_notice = notice.into();
        self
    }

    #[cfg(test)]
    pub fn shutdown_notice(&self) -> &str {
        &self.shutdown_notice
    }

    /// Register a classified connection into its channel
    ///
    /// `DuplicateBroadcaster` leaves `conn` unregistered and open.
    /// `CapacityExceeded` leaves `conn` registered as a listener but closed.
    /// `ShuttingDown` leaves `conn` unregistered, notified and closed.
    pub async fn register(
        &self,
        user_id: &str,
        channel_id: &str,
        role: Role,
        conn: &ConnectionHandle,
    ) -> RelayResult<()> {
        let mut registry = self.registry.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            debug!("Refusing {} {} after shutdown", role, user_id);
            self.notify_and_close(conn);
            return Err(RelayError::ShuttingDown);
        }

        let channel = registry.get_or_create(channel_id);
        match role {
            Role::Broadcaster => {
                let result = channel.register_broadcaster(user_id, conn.clone());
                match &result {
                    Ok(()) => info!(
                        "Broadcaster {} connected to channel {}",
                        user_id, channel_id
                    ),
                    Err(e) => warn!("{}", e),
                }
                result
            }
            Role::Listener => {
                let result = channel.register_listener(user_id, conn.clone());
                info!(
                    "Listener {} connected to channel {} ({} listeners)",
                    user_id,
                    channel_id,
                    channel.listener_count()
                );
                result
            }
        }
    }

    /// Remove a broadcaster and reclaim its channel if empty
    pub async fn deregister_broadcaster(
        &self,
        channel_id: &str,
        user_id: &str,
        conn_id: ConnectionId,
    ) {
        let mut registry = self.registry.lock().await;
        let removed = registry
            .get_mut(channel_id)
            .is_some_and(|channel| channel.deregister_broadcaster(user_id, conn_id));
        if removed {
            info!(
                "Broadcaster {} disconnected from channel {}",
                user_id, channel_id
            );
        }
        registry.remove_if_empty(channel_id);
    }

    /// Remove a listener and reclaim its channel if empty
    pub async fn deregister_listener(&self, channel_id: &str, user_id: &str, conn_id: ConnectionId) {
        let mut registry = self.registry.lock().await;
        let removed = registry
            .get_mut(channel_id)
            .is_some_and(|channel| channel.deregister_listener(conn_id));
        if removed {
            info!("Listener {} disconnected from channel {}", user_id, channel_id);
        }
        registry.remove_if_empty(channel_id);
    }

    /// Relay a broadcaster's frame to the listeners of its channel
    pub async fn forward(&self, channel_id: &str, from_user_id: &str, frame: &Payload) -> usize {
        let registry = self.registry.lock().await;
        let Some(channel) = registry.get(channel_id) else {
            return 0;
        };
        let delivered = channel.forward_frame(from_user_id, frame);
        debug!(
            "Relayed {} bytes from {} to {} listeners on {}",
            frame.len(),
            from_user_id,
            delivered,
            channel_id
        );
        delivered
    }

    /// Notify and close every registered connection, then empty the registry
    ///
    /// Registrations arriving afterwards are refused. Returns the number of
    /// connections closed.
    pub async fn shutdown(&self) -> usize {
        let channels = {
            let mut registry = self.registry.lock().await;
            self.shut_down.store(true, Ordering::SeqCst);
            info!(
                "Relay is shutting down gracefully, closing {} channels",
                registry.len()
            );
            registry.drain()
        };

        let mut closed = 0;
        for channel in &channels {
            for conn in channel.connections() {
                if let Err(e) = conn.send(Payload::Text(self.shutdown_notice.clone())) {
                    debug!("Shutdown notice not delivered: {}", e);
                }
            }
            for conn in channel.connections() {
                conn.close();
                closed += 1;
            }
            debug!(
                "Channel {} closed ({} broadcasters, {} listeners)",
                channel.id(),
                channel.broadcaster_count(),
                channel.listener_count()
            );
        }
        closed
    }

    fn notify_and_close(&self, conn: &ConnectionHandle) {
        if let Err(e) = conn.send(Payload::Text(self.shutdown_notice.clone())) {
            debug!("Shutdown notice not delivered: {}", e);
        }
        conn.close();
    }

    #[cfg(test)]
    pub async fn channel_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    #[cfg(test)]
    pub async fn has_channel(&self, channel_id: &str) -> bool {
        self.registry.lock().await.contains(channel_id)
    }

    #[cfg(test)]
    pub async fn listener_count(&self, channel_id: &str) -> usize {
        self.registry
            .lock()
            .await
            .get(channel_id)
            .map_or(0, |channel| channel.listener_count())
    }

    #[cfg(test)]
    pub async fn broadcaster_count(&self, channel_id: &str) -> usize {
        self.registry
            .lock()
            .await
            .get(channel_id)
            .map_or(0, |channel| channel.broadcaster_count())
    }
}
