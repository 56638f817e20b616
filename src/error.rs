//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize or deserialize: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Failed to initiate connection to {0}: {1}")]
    ConnectFailed(SocketAddr, #[source] quinn::ConnectError),

    #[error("Connection to {0} failed during establishment: {1}")]
    ConnectionEstablishFailed(SocketAddr, #[source] quinn::ConnectionError),

    #[error("An established connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("Failed to write to network stream: {0}")]
    WriteStream(#[from] quinn::WriteError),

    #[error("Node name is empty")]
    EmptyNodeName,

    #[error("Join requires at least one address")]
    EmptyJoinList,

    #[error("User event payload too large: {0} bytes (limit {1})")]
    UserEventTooLarge(usize, usize),

    #[error("Query payload too large: {0} bytes (limit {1})")]
    QueryTooLarge(usize, usize),

    #[error("Operation is not valid for the local node")]
    NotLocalNode,

    #[error("Serf instance is shutting down or has left the cluster")]
    NodeShuttingDown,

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("No pending queries matching ID")]
    UnknownQuery,

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("RPC protocol error: {0}")]
    Rpc(String),

    #[error("Decode error: {0}")]
    Decode(String),
}
