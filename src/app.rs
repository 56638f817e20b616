//! src/app.rs
//!
//! Defines the main `App` struct, which encapsulates the application's
//! configuration and manages the lifecycle of its concurrent services: the
//! `Serf` node itself, the event fan-out that backs RPC `stream`
//! subscribers, and the optional RPC control-plane server.

use crate::{config::Config, error::Result, rpc::log::LogLine, rpc::RpcServer, serf::Serf};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Capacity of the fan-out channel between `Serf`'s single event receiver
/// and however many RPC connections have an active `stream` subscription.
const EVENT_FANOUT_CAPACITY: usize = 1024;

pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// The main run loop: starts `Serf`, fans its event stream out to
    /// however many RPC clients subscribe, optionally serves the RPC
    /// control plane, and waits for a shutdown signal (Ctrl+C or an
    /// explicit cancellation) to tear everything down.
    pub async fn run(self, logs: broadcast::Sender<LogLine>) -> Result<()> {
        tracing::info!(
            node = %self.config.node_name,
            bind_addr = %self.config.bind_addr,
            "🚀 Starting node..."
        );

        let (serf, mut event_rx) = Serf::new(self.config.clone()).await?;

        let (events_tx, _events_keepalive) = broadcast::channel(EVENT_FANOUT_CAPACITY);
        let fanout_tx = events_tx.clone();
        let fanout_task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let _ = fanout_tx.send(event);
            }
        });

        let rpc_task = if let Some(rpc_addr) = self.config.rpc_bind_addr {
            tracing::info!(addr = %rpc_addr, "RPC control plane enabled.");
            let server = RpcServer::new(rpc_addr, self.config.rpc_auth_key.clone(), events_tx.clone(), logs);
            let serf_for_rpc = serf.clone();
            let rpc_shutdown = self.shutdown_token.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server.run(serf_for_rpc, rpc_shutdown).await {
                    tracing::error!(error = %e, "rpc.server_failed");
                }
            }))
        } else {
            None
        };

        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
            shutdown_token.cancel();
        });

        self.shutdown_token.cancelled().await;
        serf.shutdown();

        if let Some(task) = rpc_task {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "RPC server task failed");
            }
        }
        if let Err(e) = fanout_task.await {
            tracing::error!(error = ?e, "Event fan-out task failed");
        }
        tracing::info!("👋 Node has shut down gracefully.");

        Ok(())
    }
}
