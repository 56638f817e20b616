//! src/lib.rs
//!
//! Library crate root. Declares the module hierarchy for the membership,
//! gossip, query, and RPC layers, and re-exports the handful of types a
//! caller (the binary, or an embedding application) needs: `Config` to
//! configure a node, `Serf`/`SerfEvent` to run one and observe it, and the
//! crate's `Error`/`Result`.

pub mod app;
pub mod background;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod coordinate;
pub mod delegate;
pub mod domain;
pub mod error;
pub mod events;
pub mod keyring;
pub mod members;
pub mod pushpull;
pub mod query;
pub mod rpc;
pub mod serf;
pub mod snapshot;
pub mod tags;
pub mod transport;
pub mod wire;

pub use app::App;
pub use config::Config;
pub use error::{Error, Result};
pub use events::SerfEvent;
pub use serf::Serf;
