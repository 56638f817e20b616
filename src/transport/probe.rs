//! src/transport/probe.rs
//!
//! A deliberately minimal stand-in for a real SWIM-style failure detector.
//! The distilled spec treats gossip-driven failure detection as an
//! external collaborator and leaves it out of scope; this module exists
//! only so a running node produces genuine authoritative Failed
//! transitions (§4.3's `NotifyLeave`) instead of requiring an operator to
//! wire one up by hand. It is direct ping/ack only — no indirect probing
//! through a third member, no suspicion sub-protocol, no piggy-backed
//! ack payloads. A production deployment of this crate would replace it
//! with a real memberlist-equivalent.

use crate::coordinate::{Coordinate, CoordinateClient};
use crate::members::MemberManager;
use crate::transport::TransportHandle;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Byte markers for the two probe frames. Chosen outside `MessageType`'s
/// 0..=9 range so a node's ingestion loop can dispatch on the first byte
/// before attempting `SerfMessage::decode`.
pub const PING_MARKER: u8 = 0xFE;
pub const ACK_MARKER: u8 = 0xFD;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PingPayload {
    nonce: u32,
    from: String,
    coord: Option<Coordinate>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AckPayload {
    nonce: u32,
    coord: Option<Coordinate>,
}

pub fn is_probe_frame(bytes: &[u8]) -> bool {
    matches!(bytes.first(), Some(&PING_MARKER) | Some(&ACK_MARKER))
}

/// Notified once a member has missed enough consecutive pings to be
/// declared dead. `Serf` implements this by routing into the same
/// `NodeEventHandler::handle_leave` path a graceful departure would use,
/// just with `graceful = false`.
#[async_trait]
pub trait FailureObserver: Send + Sync {
    async fn notify_failed(&self, name: &str);
}

struct PendingPing {
    sent_at: Instant,
    ack: oneshot::Sender<Option<Coordinate>>,
}

/// Owns the probe schedule, the outstanding-ping table, and per-member
/// miss counters.
pub struct Prober {
    manager: Arc<MemberManager>,
    transport: TransportHandle,
    local_name: String,
    missed_threshold: u32,
    ping_timeout: Duration,
    coordinate: Arc<Mutex<CoordinateClient>>,
    pending: Mutex<HashMap<u32, PendingPing>>,
    misses: Mutex<HashMap<String, u32>>,
    /// Last coordinate reported by each peer's ack, so `GetCoordinate`
    /// queries about a remote node don't require a fresh probe round.
    peer_coords: Mutex<HashMap<String, Coordinate>>,
}

impl Prober {
    pub fn new(
        manager: Arc<MemberManager>,
        transport: TransportHandle,
        local_name: String,
        missed_threshold: u32,
        ping_timeout: Duration,
        coordinate: Arc<Mutex<CoordinateClient>>,
    ) -> Self {
        Self {
            manager,
            transport,
            local_name,
            missed_threshold,
            ping_timeout,
            coordinate,
            pending: Mutex::new(HashMap::new()),
            misses: Mutex::new(HashMap::new()),
            peer_coords: Mutex::new(HashMap::new()),
        }
    }

    pub async fn peer_coordinate(&self, name: &str) -> Option<Coordinate> {
        self.peer_coords.lock().await.get(name).cloned()
    }

    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        observer: Arc<dyn FailureObserver>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.probe_one_round(observer.as_ref()).await;
                    }
                }
            }
        });
    }

    async fn probe_one_round(&self, observer: &dyn FailureObserver) {
        let targets = self
            .manager
            .execute(|acc| {
                acc.list_by_status(crate::domain::MemberStatus::Alive)
                    .into_iter()
                    .filter(|info| info.member.name != self.local_name)
                    .map(|info| (info.member.name.clone(), SocketAddr::new(info.member.addr, info.member.port)))
                    .collect::<Vec<_>>()
            })
            .await;

        for (name, addr) in targets {
            match self.ping(addr).await {
                Some(coord) => {
                    self.misses.lock().await.remove(&name);
                    if let Some(remote) = coord {
                        self.peer_coords.lock().await.insert(name.clone(), remote);
                    }
                }
                None => {
                    let mut misses = self.misses.lock().await;
                    let count = misses.entry(name.clone()).or_insert(0);
                    *count += 1;
                    if *count >= self.missed_threshold {
                        misses.remove(&name);
                        drop(misses);
                        observer.notify_failed(&name).await;
                    }
                }
            }
        }
    }

    async fn ping(&self, addr: SocketAddr) -> Option<Option<Coordinate>> {
        let nonce: u32 = rand::thread_rng().gen();
        let (tx, rx) = oneshot::channel();
        let sent_at = Instant::now();
        self.pending.lock().await.insert(nonce, PendingPing { sent_at, ack: tx });

        let local_coord = Some(self.coordinate.lock().await.coordinate());
        let payload = PingPayload {
            nonce,
            from: self.local_name.clone(),
            coord: local_coord,
        };
        let mut frame = vec![PING_MARKER];
        frame.extend(bincode::serialize(&payload).ok()?);
        if !self.transport.send(addr, frame).await {
            self.pending.lock().await.remove(&nonce);
            return None;
        }

        match tokio::time::timeout(self.ping_timeout, rx).await {
            Ok(Ok(remote_coord)) => {
                let rtt = sent_at.elapsed();
                if let Some(ref remote) = remote_coord {
                    self.coordinate.lock().await.update(remote, rtt);
                }
                Some(remote_coord)
            }
            _ => {
                self.pending.lock().await.remove(&nonce);
                None
            }
        }
    }

    /// Routes one inbound probe frame (ping or ack). Returns `true` if the
    /// frame was a probe frame and was handled; `false` means the caller
    /// should fall through to ordinary `SerfMessage` decoding.
    pub async fn handle_inbound(&self, peer_addr: SocketAddr, bytes: &[u8]) -> bool {
        match bytes.first() {
            Some(&PING_MARKER) => {
                if let Ok(ping) = bincode::deserialize::<PingPayload>(&bytes[1..]) {
                    let local_coord = Some(self.coordinate.lock().await.coordinate());
                    let ack = AckPayload {
                        nonce: ping.nonce,
                        coord: local_coord,
                    };
                    let mut frame = vec![ACK_MARKER];
                    if let Ok(body) = bincode::serialize(&ack) {
                        frame.extend(body);
                        let _ = self.transport.send(peer_addr, frame).await;
                    }
                }
                true
            }
            Some(&ACK_MARKER) => {
                if let Ok(ack) = bincode::deserialize::<AckPayload>(&bytes[1..]) {
                    if let Some(pending) = self.pending.lock().await.remove(&ack.nonce) {
                        let _ = pending.ack.send(ack.coord);
                    }
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_probe_frames_by_marker_byte() {
        assert!(is_probe_frame(&[PING_MARKER, 1, 2]));
        assert!(is_probe_frame(&[ACK_MARKER]));
        assert!(!is_probe_frame(&[0x01]));
        assert!(!is_probe_frame(&[]));
    }
}
