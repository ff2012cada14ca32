//! TCP transport, one connection per peer session.
//!
//! A reader task pulls frames off the socket and feeds them to the session;
//! a writer task drains the session's outbound channel and encodes frames.
//! Either side failing closes the session, which drops the outbound channel
//! and lets the writer exit.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use cairn_core::wire::{FrameHeader, HEADER_LEN};
use cairn_core::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use crate::network::NetworkStore;
use crate::session::PeerSession;

/// Wrap an established connection in a session and start the handshake.
pub fn attach(store: &Arc<NetworkStore>, stream: TcpStream) -> Arc<PeerSession> {
    let remote = stream.peer_addr().ok();
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    let session = PeerSession::new(Arc::clone(store), tx, remote);
    tokio::spawn(write_loop(Arc::clone(&session), write_half, rx));
    tokio::spawn(read_loop(Arc::clone(&session), read_half));
    session.start();
    session
}

/// Connect to a peer and start the handshake.
pub async fn dial(store: &Arc<NetworkStore>, addr: SocketAddr) -> Result<Arc<PeerSession>> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    tracing::info!(%addr, "dialed peer");
    Ok(attach(store, stream))
}

/// Accept connections until shutdown.
pub async fn serve(
    listener: TcpListener,
    store: Arc<NetworkStore>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "inbound connection");
                        attach(&store, stream);
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn read_loop(session: Arc<PeerSession>, mut reader: OwnedReadHalf) {
    let mut frame = Vec::new();
    loop {
        frame.resize(HEADER_LEN, 0);
        if let Err(e) = reader.read_exact(&mut frame).await {
            tracing::debug!(session = %session.id(), error = %e, "connection closed");
            break;
        }
        let length = match FrameHeader::parse(&frame) {
            Ok((_, length)) => length,
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "bad frame header");
                break;
            }
        };
        frame.resize(HEADER_LEN + length, 0);
        if let Err(e) = reader.read_exact(&mut frame[HEADER_LEN..]).await {
            tracing::debug!(session = %session.id(), error = %e, "connection closed mid-frame");
            break;
        }
        if session.handle_frame(&frame).is_err() && session.is_closed() {
            break;
        }
    }
    session.close();
}

async fn write_loop(
    session: Arc<PeerSession>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let frame = match msg.encode() {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "message not encodable, skipped");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!(session = %session.id(), error = %e, "write failed");
            session.close();
            break;
        }
    }
    let _ = writer.shutdown().await;
}
