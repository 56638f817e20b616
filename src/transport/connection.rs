//! src/transport/connection.rs
//!
//! Establishing, caching, and using QUIC connections. Each outbound
//! message is sent on its own unidirectional stream rather than
//! multiplexed onto a shared one — framing is "one message per stream",
//! so there's no length-prefix needed at this layer; `read_to_end` with a
//! cap is the entire framing protocol.

use crate::{
    error::{Error, Result},
    transport::{ConnectionEvent, InboundMessage, MAX_MESSAGE_SIZE},
};
use quinn::{Connection, Endpoint};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, Mutex, Semaphore};

/// Establishes a connection to a peer and caches it.
pub async fn connect_to_peer(
    endpoint: Endpoint,
    connections: Arc<Mutex<HashMap<SocketAddr, Connection>>>,
    peer_addr: SocketAddr,
    conn_event_tx: mpsc::Sender<ConnectionEvent>,
) -> Result<Connection> {
    let connecting = endpoint
        .connect(peer_addr, "localhost")
        .map_err(|e| Error::ConnectFailed(peer_addr, e))?;

    let conn = connecting
        .await
        .map_err(|e| Error::ConnectionEstablishFailed(peer_addr, e))?;

    tracing::info!(peer = %peer_addr, "transport.connected");

    let _ = conn_event_tx
        .send(ConnectionEvent::PeerConnected { peer_addr })
        .await;

    connections.lock().await.insert(peer_addr, conn.clone());
    Ok(conn)
}

/// Gets a cached connection or creates a new one.
async fn get_or_create_connection(
    endpoint: Endpoint,
    connections: Arc<Mutex<HashMap<SocketAddr, Connection>>>,
    addr: SocketAddr,
    conn_event_tx: mpsc::Sender<ConnectionEvent>,
) -> Result<Connection> {
    let mut conns_guard = connections.lock().await;
    if let Some(conn) = conns_guard.get(&addr) {
        if conn.close_reason().is_none() {
            return Ok(conn.clone());
        }
        conns_guard.remove(&addr);
    }
    drop(conns_guard);
    connect_to_peer(endpoint, connections, addr, conn_event_tx).await
}

/// Sends a single already-framed message to a peer, using the connection
/// cache.
pub async fn send_message_to_peer(
    endpoint: Endpoint,
    connections: Arc<Mutex<HashMap<SocketAddr, Connection>>>,
    addr: SocketAddr,
    bytes: Vec<u8>,
    conn_event_tx: mpsc::Sender<ConnectionEvent>,
) -> Result<()> {
    let conn = get_or_create_connection(endpoint, connections, addr, conn_event_tx).await?;
    let mut send_stream = conn.open_uni().await?;
    send_stream.write_all(&bytes).await?;
    send_stream.finish().await?;
    tracing::trace!(peer = %addr, "transport.sent");
    Ok(())
}

/// Handles a single established QUIC connection, processing all incoming
/// streams by handing their raw bytes to `inbound_tx` untouched — framing
/// interpretation (`wire::SerfMessage::decode`) happens downstream.
pub async fn handle_connection(
    conn: quinn::Connecting,
    connections: Arc<Mutex<HashMap<SocketAddr, Connection>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    conn_event_tx: mpsc::Sender<ConnectionEvent>,
    stream_semaphore: Arc<Semaphore>,
) -> Result<()> {
    let connection = conn.await?;
    let peer_addr = connection.remote_address();
    tracing::info!(peer = %peer_addr, "transport.accepted");

    let _ = conn_event_tx
        .send(ConnectionEvent::PeerConnected { peer_addr })
        .await;

    connections.lock().await.insert(peer_addr, connection.clone());

    loop {
        tokio::select! {
            stream = connection.accept_uni() => {
                match stream {
                    Ok(mut recv) => {
                        let inbound_tx = inbound_tx.clone();
                        let permit = match stream_semaphore.clone().acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => {
                                tracing::warn!("transport.semaphore_closed");
                                break Ok(());
                            }
                        };
                        tokio::spawn(async move {
                            match recv.read_to_end(MAX_MESSAGE_SIZE).await {
                                Ok(bytes) => {
                                    let inbound = InboundMessage { peer_addr, bytes };
                                    if inbound_tx.send(inbound).await.is_err() {
                                        tracing::warn!("transport.inbound_channel_closed");
                                    }
                                }
                                Err(e) => tracing::error!(from = %peer_addr, error = %e, "transport.stream_read_failed"),
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer_addr, error = %e, "transport.stream_accept_failed");
                        break Ok(());
                    }
                }
            }
            reason = connection.closed() => {
                 tracing::info!(peer = %peer_addr, reason = %reason, "transport.connection_closed");
                 let _ = conn_event_tx.send(ConnectionEvent::PeerDisconnected { peer_addr }).await;
                 connections.lock().await.remove(&peer_addr);
                 return Ok(());
            }
        }
    }
}
