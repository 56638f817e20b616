//! tests/common/harness.rs
//!
//! A small test harness for spinning up clusters of real nodes over
//! loopback TCP/QUIC and driving them through the RPC control plane. This
//! is the building block for all integration tests, abstracting away the
//! boilerplate of:
//! - Generating a self-signed certificate per node (the gossip transport's
//!   TLS layer expects `certs/{ca,node}.{cert,key}` relative to the
//!   process's current directory).
//! - Creating a temporary directory and config for each node.
//! - Spawning a node's `App` in the background.
//! - Speaking the RPC protocol directly to it.
//! - Graceful shutdown.

use anyhow::{Context, Result};
use serfkit::rpc::codec::{decode, encode, read_frame, write_frame, RequestHeader, ResponseHeader};
use serfkit::rpc::log::LogTap;
use serfkit::{App, Config};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::{SocketAddr, TcpListener},
    path::Path,
    time::Duration,
};
use tempfile::{tempdir, TempDir};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// A self-signed certificate, trusted directly as its own CA — simplest
/// thing the gossip transport's `configure_tls` will accept.
pub struct CertSet {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl CertSet {
    fn write_to_disk(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("ca.cert"), &self.cert_der)?;
        fs::write(dir.join("node.cert"), &self.cert_der)?;
        fs::write(dir.join("node.key"), &self.key_der)?;
        Ok(())
    }
}

pub fn generate_cert(domain: &str) -> Result<CertSet> {
    let certified = rcgen::generate_simple_self_signed(vec![domain.to_string()])
        .context("failed to generate self-signed certificate")?;
    Ok(CertSet {
        cert_der: certified.cert.der().to_vec(),
        key_der: certified.key_pair.serialize_der(),
    })
}

fn ephemeral_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?)
}

/// A handle to a running node in a test cluster.
pub struct TestNode {
    pub config: Config,
    pub gossip_addr: SocketAddr,
    pub rpc_addr: SocketAddr,
    shutdown_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestNode {
    /// Configures and spawns a new node in a background task. `bootstrap`
    /// names peers to join at startup; pass an empty slice to start alone.
    pub async fn spawn(name: &str, bootstrap: Vec<SocketAddr>) -> Result<Self> {
        let temp_dir = tempdir().context("failed to create temp dir")?;
        let certs_dir = temp_dir.path().join("certs");
        generate_cert(name)?.write_to_disk(&certs_dir)?;

        let gossip_addr = ephemeral_addr()?;
        let rpc_addr = ephemeral_addr()?;

        let mut config = Config::default();
        config.node_name = name.to_string();
        config.bind_addr = gossip_addr;
        config.bootstrap_peers = bootstrap;
        config.gossip_interval_ms = 100;
        config.reap_interval_ms = 2_000;
        config.reconnect_interval_ms = 2_000;
        config.rpc_bind_addr = Some(rpc_addr);

        let shutdown_token = CancellationToken::new();
        let app_dir = temp_dir.path().to_path_buf();
        let app_config = config.clone();
        let app_token = shutdown_token.clone();
        let original_dir = std::env::current_dir()?;

        tokio::spawn(async move {
            std::env::set_current_dir(&app_dir).expect("failed to chdir for spawned node");
            let (_tap, logs) = LogTap::new();
            if let Err(e) = App::new(app_config).expect("failed to build app").run(logs).await {
                if !app_token.is_cancelled() {
                    tracing::error!(error = ?e, "test node app failed");
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::env::set_current_dir(original_dir).ok();

        Ok(Self {
            config,
            gossip_addr,
            rpc_addr,
            shutdown_token,
            _temp_dir: temp_dir,
        })
    }

    /// Opens a fresh RPC connection to this node.
    pub async fn rpc(&self) -> Result<RpcClient> {
        RpcClient::connect(self.rpc_addr).await
    }

    /// Shuts the node down; the spawned task notices and returns.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

/// A bare-bones synchronous-style RPC client speaking the same
/// length-prefixed, two-frame protocol the server implements, used by
/// tests to drive a node the way an external CLI would.
pub struct RpcClient {
    stream: TcpStream,
    next_seq: u64,
}

impl RpcClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("rpc connect failed")?;
        stream.set_nodelay(true).ok();
        Ok(Self { stream, next_seq: 1 })
    }

    /// Sends one request and reads back its single response frame pair.
    /// Not suitable for `query`/`stream`/`monitor`, which keep pushing
    /// unframed record frames after the initial ack — use `request_raw`
    /// and `read_record` for those.
    pub async fn request<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &mut self,
        command: &str,
        req: &Req,
    ) -> Result<Resp> {
        let seq = self.request_raw(command, req).await?;
        self.read_response(seq).await
    }

    pub async fn request_raw<Req: Serialize>(&mut self, command: &str, req: &Req) -> Result<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let header = encode(&RequestHeader { seq, command: command.to_string() })?;
        write_frame(&mut self.stream, &header).await?;
        let body = encode(req)?;
        write_frame(&mut self.stream, &body).await?;
        Ok(seq)
    }

    pub async fn read_response<Resp: for<'de> Deserialize<'de>>(&mut self, expect_seq: u64) -> Result<Resp> {
        let header_bytes = read_frame(&mut self.stream).await?;
        let header: ResponseHeader = decode(&header_bytes)?;
        anyhow::ensure!(header.seq == expect_seq, "response seq mismatch: got {}, expected {expect_seq}", header.seq);
        let body_bytes = read_frame(&mut self.stream).await?;
        if !header.error.is_empty() {
            anyhow::bail!("rpc error: {}", header.error);
        }
        Ok(decode(&body_bytes)?)
    }

    /// Reads one unframed record pushed by a `query`/`stream`/`monitor`
    /// subscription.
    pub async fn read_record<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T> {
        let bytes = read_frame(&mut self.stream).await?;
        Ok(decode(&bytes)?)
    }
}
