//! src/snapshot.rs
//!
//! Periodically persists enough state to disk that a restarted node can
//! rejoin the cluster without an operator re-supplying the peer list
//! (§4.9). The on-disk format is line-oriented and intentionally simple;
//! nothing downstream of this module parses it, so its shape is free to
//! evolve under the `Snapshotter` trait boundary.

use crate::clock::LamportTime;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};

/// What the rest of the node needs from persisted state: the three clocks
/// (so gossip doesn't re-witness events it has already seen) and the last
/// known set of alive peers (so `bootstrap` has somewhere to dial).
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn last_clock(&self) -> LamportTime;
    async fn last_event_clock(&self) -> LamportTime;
    async fn last_query_clock(&self) -> LamportTime;
    async fn alive_nodes(&self) -> Vec<(String, std::net::SocketAddr)>;

    /// Records a member join/leave so a restart can recompute `alive_nodes`.
    async fn record_member(&self, name: &str, addr: std::net::SocketAddr, alive: bool);
    async fn record_clock(&self, member: LamportTime, event: LamportTime, query: LamportTime);

    /// Marks this node as having left gracefully, which suppresses
    /// auto-rejoin on the next startup — mirrors the "leave marker" the
    /// distilled spec calls out.
    async fn leave(&self);
    async fn left(&self) -> bool;
}

#[derive(Debug)]
enum Record {
    Clock {
        member: LamportTime,
        event: LamportTime,
        query: LamportTime,
    },
    Member {
        name: String,
        addr: std::net::SocketAddr,
        alive: bool,
    },
    Leave,
}

struct State {
    member_clock: LamportTime,
    event_clock: LamportTime,
    query_clock: LamportTime,
    alive: std::collections::HashMap<String, std::net::SocketAddr>,
    left: bool,
}

/// Append-only file-backed snapshotter. Writes are funneled through a
/// single background task so concurrent callers never interleave partial
/// lines; `record_*` calls are fire-and-forget from the caller's
/// perspective.
pub struct FileSnapshotter {
    state: Mutex<State>,
    tx: mpsc::UnboundedSender<Record>,
}

impl FileSnapshotter {
    /// Loads existing state from `path` if present, then spawns the
    /// append-only writer task.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = Self::load(&path).await.unwrap_or(State {
            member_clock: LamportTime::ZERO,
            event_clock: LamportTime::ZERO,
            query_clock: LamportTime::ZERO,
            alive: std::collections::HashMap::new(),
            left: false,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::writer_loop(path, rx));

        Ok(Self {
            state: Mutex::new(state),
            tx,
        })
    }

    async fn load(path: &Path) -> Option<State> {
        let contents = fs::read_to_string(path).await.ok()?;
        let mut state = State {
            member_clock: LamportTime::ZERO,
            event_clock: LamportTime::ZERO,
            query_clock: LamportTime::ZERO,
            alive: std::collections::HashMap::new(),
            left: false,
        };
        for line in contents.lines() {
            Self::apply_line(&mut state, line);
        }
        Some(state)
    }

    fn apply_line(state: &mut State, line: &str) {
        let mut parts = line.splitn(2, ' ');
        let Some(tag) = parts.next() else { return };
        let Some(rest) = parts.next() else { return };
        match tag {
            "clock" => {
                let fields: Vec<&str> = rest.split(',').collect();
                if fields.len() == 3 {
                    if let (Ok(m), Ok(e), Ok(q)) = (
                        fields[0].parse::<u64>(),
                        fields[1].parse::<u64>(),
                        fields[2].parse::<u64>(),
                    ) {
                        state.member_clock = LamportTime(m);
                        state.event_clock = LamportTime(e);
                        state.query_clock = LamportTime(q);
                    }
                }
            }
            "alive" => {
                if let Some((name, addr)) = rest.split_once(',') {
                    if let Ok(addr) = addr.parse() {
                        state.alive.insert(name.to_string(), addr);
                    }
                }
            }
            "not-alive" => {
                state.alive.remove(rest);
            }
            "leave" => state.left = true,
            _ => {}
        }
    }

    async fn writer_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<Record>) {
        let file = fs::OpenOptions::new().create(true).append(true).open(&path).await;
        let mut file = match file {
            Ok(f) => f,
            Err(err) => {
                tracing::error!(?err, path = %path.display(), "snapshot.open_failed");
                return;
            }
        };

        while let Some(record) = rx.recv().await {
            let line = match record {
                Record::Clock { member, event, query } => {
                    format!("clock {},{},{}\n", member.0, event.0, query.0)
                }
                Record::Member { name, addr, alive } => {
                    if alive {
                        format!("alive {},{}\n", name, addr)
                    } else {
                        format!("not-alive {}\n", name)
                    }
                }
                Record::Leave => "leave\n".to_string(),
            };
            if let Err(err) = file.write_all(line.as_bytes()).await {
                tracing::warn!(?err, "snapshot.write_failed");
            }
        }
        let _ = file.flush().await;
    }

    fn send(&self, record: Record) {
        // The writer task only stops once every sender (including this
        // one) is dropped, so this can't fail in practice; ignore it
        // rather than propagate an error nobody can act on.
        let _ = self.tx.send(record);
    }
}

#[async_trait]
impl Snapshotter for FileSnapshotter {
    async fn last_clock(&self) -> LamportTime {
        self.state.lock().await.member_clock
    }

    async fn last_event_clock(&self) -> LamportTime {
        self.state.lock().await.event_clock
    }

    async fn last_query_clock(&self) -> LamportTime {
        self.state.lock().await.query_clock
    }

    async fn alive_nodes(&self) -> Vec<(String, std::net::SocketAddr)> {
        self.state
            .lock()
            .await
            .alive
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    async fn record_member(&self, name: &str, addr: std::net::SocketAddr, alive: bool) {
        {
            let mut state = self.state.lock().await;
            if alive {
                state.alive.insert(name.to_string(), addr);
            } else {
                state.alive.remove(name);
            }
        }
        self.send(Record::Member {
            name: name.to_string(),
            addr,
            alive,
        });
    }

    async fn record_clock(&self, member: LamportTime, event: LamportTime, query: LamportTime) {
        {
            let mut state = self.state.lock().await;
            state.member_clock = member;
            state.event_clock = event;
            state.query_clock = query;
        }
        self.send(Record::Clock { member, event, query });
    }

    async fn leave(&self) {
        self.state.lock().await.left = true;
        self.send(Record::Leave);
    }

    async fn left(&self) -> bool {
        self.state.lock().await.left
    }
}

/// A no-op snapshotter used when `snapshot_path` is unset, so the rest of
/// the node never needs to special-case "snapshotting disabled".
pub struct NullSnapshotter;

#[async_trait]
impl Snapshotter for NullSnapshotter {
    async fn last_clock(&self) -> LamportTime {
        LamportTime::ZERO
    }
    async fn last_event_clock(&self) -> LamportTime {
        LamportTime::ZERO
    }
    async fn last_query_clock(&self) -> LamportTime {
        LamportTime::ZERO
    }
    async fn alive_nodes(&self) -> Vec<(String, std::net::SocketAddr)> {
        Vec::new()
    }
    async fn record_member(&self, _name: &str, _addr: std::net::SocketAddr, _alive: bool) {}
    async fn record_clock(&self, _member: LamportTime, _event: LamportTime, _query: LamportTime) {}
    async fn leave(&self) {}
    async fn left(&self) -> bool {
        false
    }
}

pub async fn build(path: Option<&str>) -> Result<Box<dyn Snapshotter>> {
    match path {
        Some(path) => {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| Error::Snapshot(e.to_string()))?;
                }
            }
            Ok(Box::new(FileSnapshotter::open(path).await?))
        }
        None => Ok(Box::new(NullSnapshotter)),
    }
}
