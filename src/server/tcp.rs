//! Raw TCP transport
//!
//! A byte stream has no message boundaries, so the connection is read line by
//! line until the session is classified and in raw chunks afterwards. Chunk
//! boundaries are whatever the socket read returns.
//!
//! Handshake lines are capped at `MAX_HANDSHAKE_LEN` bytes. A longer line is
//! dropped up to its terminator without being buffered, and bytes that are not
//! UTF-8 are decoded lossily so the line is discarded like any other
//! malformed handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use super::handler::Session;
use crate::relay::{ConnectionHandle, Outbound, Payload, RelayEngine};

/// Size of a single relayed read once the handshake is done
const READ_CHUNK_SIZE: usize = 4096;

/// Longest handshake line accepted, terminator included
const MAX_HANDSHAKE_LEN: usize = 1024;

/// Outcome of one read from the socket
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Payload(Payload),
    /// Part of an overlong handshake line
    Discarded,
    Eof,
}

/// Handle a single raw TCP connection
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    engine: Arc<RelayEngine>,
    mut disconnect_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New TCP connection from {}", peer_addr);

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (conn, outbound_rx) = ConnectionHandle::new(peer_addr.to_string());
    let writer = tokio::spawn(write_outbound(write_half, outbound_rx));
    let mut session = Session::new(conn.clone(), engine);

    let mut line = Vec::with_capacity(MAX_HANDSHAKE_LEN);
    let mut overlong = false;
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let awaiting_handshake = session.awaiting_handshake();
        // Bytes buffered behind the handshake line stay in `reader` and come
        // out as the first chunk.
        let read = async {
            if awaiting_handshake {
                read_handshake_line(&mut reader, &mut line, &mut overlong).await
            } else {
                let n = reader.read(&mut chunk).await?;
                Ok(if n == 0 {
                    Inbound::Eof
                } else {
                    Inbound::Payload(Payload::Binary(chunk[..n].to_vec()))
                })
            }
        };

        tokio::select! {
            result = read => {
                match result {
                    Ok(Inbound::Payload(payload)) => session.on_payload(payload).await,
                    Ok(Inbound::Discarded) => {}
                    Ok(Inbound::Eof) => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                    Err(e) => {
                        session.on_error(e).await;
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

/// Read one handshake line of at most `MAX_HANDSHAKE_LEN` bytes
///
/// `overlong` carries across calls: once a line hits the cap, every read up to
/// and including its terminator is discarded.
async fn read_handshake_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    overlong: &mut bool,
) -> std::io::Result<Inbound>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let n = AsyncReadExt::take(&mut *reader, MAX_HANDSHAKE_LEN as u64)
        .read_until(b'\n', line)
        .await?;
    if n == 0 {
        return Ok(Inbound::Eof);
    }

    let terminated = line.last() == Some(&b'\n');
    let truncated = std::mem::replace(overlong, !terminated);
    if truncated || !terminated {
        debug!("Discarding {} bytes of an overlong handshake line", n);
        return Ok(Inbound::Discarded);
    }
    Ok(Inbound::Payload(Payload::Text(
        String::from_utf8_lossy(line).into_owned(),
    )))
}

/// Drain a connection's outbound queue into the socket's write half
async fn write_outbound<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            Outbound::Payload(Payload::Text(text)) => writer.write_all(text.as_bytes()).await,
            Outbound::Payload(Payload::Binary(data)) => writer.write_all(&data).await,
            Outbound::Close => {
                let _ = writer.shutdown().await;
                break;
            }
        };
        if let Err(e) = result {
            debug!("TCP write failed: {}", e);
            break;
        }
    }
}
