//! Relay server and WebSocket transport
//!
//! Accepts connections on the configured transport, hands each one to a
//! session, and coordinates graceful shutdown with the relay engine.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info};

use super::handler::Session;
use super::tcp;
use crate::config::{RelayConfig, Transport};
use crate::relay::{ChannelRegistry, ConnectionHandle, Outbound, Payload, RelayEngine};

/// Relay server accepting broadcaster and listener connections
pub struct RelayServer {
    config: RelayConfig,
    engine: Arc<RelayEngine>,
    shutdown_tx: broadcast::Sender<()>,
    /// Signals connection tasks once registered connections are closed
    disconnect_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server with its own channel registry
    pub fn new(config: RelayConfig) -> Self {
        let registry = ChannelRegistry::new(config.max_listeners);
        let engine =
            RelayEngine::new(registry).with_shutdown_notice(config.shutdown_notice.clone());
        Self::with_engine(config, Arc::new(engine))
    }

    /// Create a relay server around an existing engine
    pub fn with_engine(config: RelayConfig, engine: Arc<RelayEngine>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            config,
            engine,
            shutdown_tx,
            disconnect_tx,
        }
    }

    #[cfg(test)]
    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown
    ///
    /// On shutdown every registered connection receives the shutdown notice
    /// and is closed, then connections that never completed a handshake are
    /// dropped.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        match self.config.transport {
            Transport::WebSocket => info!("Relay listening on ws://{}", addr),
            Transport::Tcp => info!("Relay listening on tcp://{}", addr),
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let closed = self.engine.shutdown().await;
        info!("Closed {} relay connections", closed);
        let _ = self.disconnect_tx.send(());
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let engine = Arc::clone(&self.engine);
        let disconnect_rx = self.disconnect_tx.subscribe();
        let transport = self.config.transport;

        tokio::spawn(async move {
            let result = match transport {
                Transport::WebSocket => {
                    handle_connection(stream, peer_addr, engine, disconnect_rx).await
                }
                Transport::Tcp => {
                    tcp::handle_connection(stream, peer_addr, engine, disconnect_rx).await
                }
            };
            if let Err(e) = result {
                error!("Connection error from {}: {}", peer_addr, e);
            }
        });
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    engine: Arc<RelayEngine>,
    mut disconnect_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New WebSocket connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();

    let (conn, outbound_rx) = ConnectionHandle::new(peer_addr.to_string());
    let writer = tokio::spawn(write_outbound(ws_sender, outbound_rx));
    let mut session = Session::new(conn.clone(), engine);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.on_payload(Payload::Text(text)).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        session.on_payload(Payload::Binary(data)).await;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Answered by tungstenite on the next write
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Pong received from {}", peer_addr);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        session.on_error(e).await;
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            // Evicted or closed by shutdown
            _ = conn.closed() => {
                break;
            }
            _ = disconnect_rx.recv() => {
                conn.close();
                break;
            }
        }
    }

    session.on_close().await;
    conn.close();
    let _ = writer.await;

    info!("Connection from {} closed", peer_addr);
    Ok(())
}

/// Drain a connection's outbound queue into a WebSocket sink
async fn write_outbound<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(outbound) = rx.recv().await {
        let message = match outbound {
            Outbound::Payload(Payload::Text(text)) => Message::Text(text),
            Outbound::Payload(Payload::Binary(data)) => Message::Binary(data),
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if let Err(e) = sink.send(message).await {
            debug!("WebSocket write failed: {}", e);
            break;
        }
    }
}
