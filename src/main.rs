//! src/main.rs
//!
//! Binary entry point. Responsible for initializing tracing, loading
//! configuration, instantiating the main `App`, and running it.

use anyhow::Context;
use serfkit::rpc::log::LogTap;
use serfkit::{App, Config};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tap, logs) = LogTap::new();

    // RUST_LOG=info will be the default. The log tap mirrors every event
    // onto a broadcast channel so the RPC `monitor` command can tail it.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(log_tap)
        .init();

    // Load configuration.
    let config = Config::load().context("Failed to load configuration")?;

    // Create and run the application.
    if let Err(e) = App::new(config)?.run(logs).await {
        tracing::error!(error = %e, "💥 Application failed");
        std::process::exit(1);
    }

    Ok(())
}
