//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`, exactly the
//! way the teacher crate's single-purpose config did — expanded here to
//! cover every tunable the membership, event, query, and RPC layers need.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub node_name: String,
    pub bind_addr: SocketAddr,
    pub advertise_addr: Option<SocketAddr>,
    pub tags: BTreeMap<String, String>,
    pub bootstrap_peers: Vec<SocketAddr>,

    // --- Gossip / broadcast tuning ---
    pub gossip_interval_ms: u64,
    pub gossip_nodes: usize,
    pub queue_check_interval_ms: u64,
    pub queue_depth_warning: usize,
    pub max_queue_depth: usize,
    pub retransmit_mult: usize,

    // --- Event tuning ---
    pub user_event_size_limit: usize,
    pub event_buffer_size: u64,
    pub coalesce_period_ms: u64,
    pub quiescent_period_ms: u64,
    pub user_coalesce_period_ms: u64,
    pub user_quiescent_period_ms: u64,

    // --- Query tuning ---
    pub query_size_limit: usize,
    pub query_response_size_limit: usize,
    pub query_buffer_size: u64,
    pub query_timeout_mult: u64,

    // --- Membership lifecycle ---
    pub recent_intent_timeout_ms: u64,
    pub reap_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub tombstone_timeout_ms: u64,
    pub flap_timeout_ms: u64,
    pub enable_name_conflict_resolution: bool,

    // --- Coordinates ---
    pub disable_coordinates: bool,

    // --- Persistence ---
    pub snapshot_path: Option<PathBuf>,

    // --- RPC ---
    pub rpc_bind_addr: Option<SocketAddr>,
    pub rpc_auth_key: Option<String>,
}

impl Config {
    /// Loads configuration from `config.toml` and environment variables
    /// prefixed `SERFKIT_`, layered over `Config::default()`.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("SERFKIT_"))
            .extract()
    }

    pub fn advertise_or_bind(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.bind_addr)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: hostname_guess(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 7946),
            advertise_addr: None,
            tags: BTreeMap::new(),
            bootstrap_peers: Vec::new(),

            gossip_interval_ms: 200,
            gossip_nodes: 3,
            queue_check_interval_ms: 30_000,
            queue_depth_warning: 128,
            max_queue_depth: 4096,
            retransmit_mult: 4,

            user_event_size_limit: 512,
            event_buffer_size: 512,
            coalesce_period_ms: 0,
            quiescent_period_ms: 0,
            user_coalesce_period_ms: 0,
            user_quiescent_period_ms: 0,

            query_size_limit: 1024,
            query_response_size_limit: 1024,
            query_buffer_size: 512,
            query_timeout_mult: 16,

            recent_intent_timeout_ms: 5 * 60 * 1000,
            reap_interval_ms: 15_000,
            reconnect_interval_ms: 30_000,
            reconnect_timeout_ms: 24 * 60 * 60 * 1000,
            tombstone_timeout_ms: 24 * 60 * 60 * 1000,
            flap_timeout_ms: 60_000,
            enable_name_conflict_resolution: true,

            disable_coordinates: false,

            snapshot_path: None,

            rpc_bind_addr: None,
            rpc_auth_key: None,
        }
    }
}

fn hostname_guess() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string())
}
