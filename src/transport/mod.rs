//! src/transport/mod.rs
//!
//! The gossip transport actor: all low-level network I/O over QUIC. It
//! knows nothing about `SerfMessage` semantics — it ferries already-framed
//! bytes (see `wire.rs`) between peers and hands inbound ones to whoever
//! owns the `inbound_tx` side, which is `Serf`'s own ingestion loop.

use crate::{
    error::Result,
    transport::{connection::handle_connection, tls::configure_tls},
};
use quinn::{Connection, Endpoint, TokioRuntime};
use socket2::{Domain, Protocol, Socket, Type};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

pub mod connection;
pub mod probe;
pub mod tls;

/// The maximum allowed size for a single framed message on a QUIC stream.
const MAX_MESSAGE_SIZE: usize = 1_024 * 1_024; // 1 MiB
const MAX_CONCURRENT_STREAMS: usize = 256;

/// Commands sent to the `Transport` service.
#[derive(Debug)]
pub enum TransportCommand {
    SendMessage(SocketAddr, Vec<u8>),
}

/// An already-framed message received from a peer.
#[derive(Debug)]
pub struct InboundMessage {
    pub peer_addr: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Connection lifecycle events, consumed by the probe loop to seed/clear
/// its own liveness tracking for a peer.
#[derive(Debug)]
pub enum ConnectionEvent {
    PeerConnected { peer_addr: SocketAddr },
    PeerDisconnected { peer_addr: SocketAddr },
}

/// The gossip transport actor.
pub struct Transport {
    endpoint: Endpoint,
    command_rx: mpsc::Receiver<TransportCommand>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    conn_event_tx: mpsc::Sender<ConnectionEvent>,
    bootstrap_peers: Vec<SocketAddr>,
    connections: Arc<Mutex<HashMap<SocketAddr, Connection>>>,
    stream_semaphore: Arc<Semaphore>,
}

impl Transport {
    pub fn new(
        bind_addr: SocketAddr,
        bootstrap_peers: Vec<SocketAddr>,
        command_rx: mpsc::Receiver<TransportCommand>,
        inbound_tx: mpsc::Sender<InboundMessage>,
        conn_event_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Self> {
        let (server_config, client_config) = configure_tls()?;

        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        std_socket.set_nonblocking(true)?;

        let mut endpoint = Endpoint::new(
            Default::default(),
            Some(server_config),
            std_socket,
            Arc::new(TokioRuntime),
        )?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            command_rx,
            inbound_tx,
            conn_event_tx,
            bootstrap_peers,
            connections: Arc::new(Mutex::new(HashMap::new())),
            stream_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_STREAMS)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr().unwrap()
    }

    pub async fn run(mut self, shutdown_token: CancellationToken) {
        let local_addr = self.endpoint.local_addr().unwrap();
        tracing::info!(listen_addr = %local_addr, "transport.started");

        for &peer_addr in &self.bootstrap_peers {
            let endpoint = self.endpoint.clone();
            let connections = self.connections.clone();
            let conn_event_tx = self.conn_event_tx.clone();
            tokio::spawn(async move {
                tracing::info!(peer = %peer_addr, "transport.dial_bootstrap_peer");
                if let Err(e) = connection::connect_to_peer(endpoint, connections, peer_addr, conn_event_tx).await {
                    tracing::error!(peer = %peer_addr, error = %e, "transport.bootstrap_dial_failed");
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("transport.shutdown");
                    break;
                },
                Some(conn) = self.endpoint.accept() => {
                    let connections = self.connections.clone();
                    let inbound_tx = self.inbound_tx.clone();
                    let conn_event_tx = self.conn_event_tx.clone();
                    let stream_semaphore = self.stream_semaphore.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, connections, inbound_tx, conn_event_tx, stream_semaphore).await {
                            tracing::error!(error = %e, "transport.connection_failed");
                        }
                    });
                },
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }
                else => {
                    tracing::info!("transport.command_channel_closed");
                    break;
                }
            }
        }
        self.endpoint.wait_idle().await;
    }

    async fn handle_command(&self, command: TransportCommand) {
        match command {
            TransportCommand::SendMessage(addr, bytes) => {
                let endpoint = self.endpoint.clone();
                let connections = self.connections.clone();
                let conn_event_tx = self.conn_event_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection::send_message_to_peer(endpoint, connections, addr, bytes, conn_event_tx).await {
                        tracing::warn!(peer = %addr, error = %e, "transport.send_failed");
                    }
                });
            }
        }
    }
}

/// A cloneable handle for submitting outbound sends without owning the
/// transport actor itself.
#[derive(Clone)]
pub struct TransportHandle {
    command_tx: mpsc::Sender<TransportCommand>,
}

impl TransportHandle {
    pub fn new(command_tx: mpsc::Sender<TransportCommand>) -> Self {
        Self { command_tx }
    }

    pub async fn send(&self, addr: SocketAddr, bytes: Vec<u8>) -> bool {
        self.command_tx.send(TransportCommand::SendMessage(addr, bytes)).await.is_ok()
    }
}
