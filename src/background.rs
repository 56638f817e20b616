//! src/background.rs
//!
//! The three periodic loops that keep the registry and broadcast queues
//! healthy without anyone calling in: reaping long-gone members, nudging
//! reconnection attempts at Failed members, and watching queue depth for
//! the warning log the distilled spec calls for (§4.10).

use crate::broadcast::BroadcastQueues;
use crate::domain::MemberStatus;
use crate::events::{MemberEvent, MemberEventKind, SerfEvent};
use crate::members::MemberManager;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Injected so the reconnect loop doesn't need to know about transport
/// internals; `transport/probe.rs` provides the real implementation, tests
/// provide a recording stub.
#[async_trait]
pub trait Reconnector: Send + Sync {
    async fn try_connect(&self, addr: std::net::IpAddr, port: u16) -> bool;
}

pub struct ReaperConfig {
    pub interval: Duration,
    pub tombstone_timeout: Duration,
    pub reconnect_timeout: Duration,
}

/// Periodically removes members that have sat in Left/Failed long enough
/// (past `tombstone_timeout`/`reconnect_timeout` respectively), emitting a
/// `Reap` event for each.
pub fn spawn_reaper(
    manager: Arc<MemberManager>,
    config: ReaperConfig,
    event_tx: mpsc::Sender<SerfEvent>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    reap_once(&manager, &config, &event_tx).await;
                }
            }
        }
    });
}

async fn reap_once(manager: &MemberManager, config: &ReaperConfig, event_tx: &mpsc::Sender<SerfEvent>) {
    let now = Instant::now();
    let expired = manager
        .execute(|acc| {
            let mut expired = Vec::new();
            for info in acc.list_all() {
                let timeout = match info.member.status {
                    MemberStatus::Left => config.tombstone_timeout,
                    MemberStatus::Failed => config.reconnect_timeout,
                    _ => continue,
                };
                let Some(leave_time) = info.leave_time else { continue };
                if leave_time.elapsed() >= timeout {
                    expired.push(info.member.clone());
                }
            }
            for member in &expired {
                acc.remove(&member.name);
            }
            expired
        })
        .await;

    for member in expired {
        tracing::info!(member = %member.name, "member.reaped");
        let _ = event_tx
            .send(SerfEvent::Member(MemberEvent {
                kind: MemberEventKind::Reap,
                members: vec![member],
            }))
            .await;
    }
}

/// Periodically attempts to reconnect to one randomly-chosen Failed
/// member. A successful dial doesn't mutate the registry directly — it
/// relies on the transport's own authoritative join callback to do that,
/// the same path a fresh incoming connection would take.
pub fn spawn_reconnector(
    manager: Arc<MemberManager>,
    reconnector: Arc<dyn Reconnector>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    reconnect_once(&manager, reconnector.as_ref()).await;
                }
            }
        }
    });
}

async fn reconnect_once(manager: &MemberManager, reconnector: &dyn Reconnector) {
    let candidate = manager
        .execute(|acc| {
            let failed = acc.list_by_status(MemberStatus::Failed);
            if failed.is_empty() {
                return None;
            }
            let idx = rand::random::<usize>() % failed.len();
            Some(failed[idx].member.clone())
        })
        .await;

    if let Some(member) = candidate {
        let ok = reconnector.try_connect(member.addr, member.port).await;
        tracing::debug!(member = %member.name, ok, "member.reconnect_attempt");
    }
}

/// Periodically logs a warning if any broadcast queue's depth exceeds the
/// configured threshold, so an operator notices backpressure before
/// messages start getting shed.
pub fn spawn_queue_monitor(
    queues: Arc<Mutex<BroadcastQueues>>,
    interval: Duration,
    warning_depth: usize,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let depth = queues.lock().await.total_depth();
                    if depth > warning_depth {
                        tracing::warn!(depth, warning_depth, "broadcast.queue_deep");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Member;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn member(name: &str) -> Member {
        Member::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), 7946)
    }

    #[tokio::test]
    async fn reaper_removes_long_left_members_and_emits_reap() {
        let manager = Arc::new(MemberManager::new(member("local")));
        manager
            .execute(|acc| acc.authoritative_join(member("a"), crate::clock::LamportTime(1)))
            .await;
        manager
            .execute(|acc| {
                acc.authoritative_leave("a", crate::clock::LamportTime(2), true, Instant::now())
            })
            .await;

        let (tx, mut rx) = mpsc::channel(8);
        let config = ReaperConfig {
            interval: Duration::from_millis(10),
            tombstone_timeout: Duration::from_millis(0),
            reconnect_timeout: Duration::from_secs(3600),
        };
        reap_once(&manager, &config, &tx).await;

        let event = rx.try_recv().unwrap();
        match event {
            SerfEvent::Member(m) => assert_eq!(m.kind, MemberEventKind::Reap),
            _ => panic!("expected reap event"),
        }
        assert_eq!(manager.count().await, 1);
    }

    struct CountingReconnector(AtomicUsize);

    #[async_trait]
    impl Reconnector for CountingReconnector {
        async fn try_connect(&self, _addr: IpAddr, _port: u16) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[tokio::test]
    async fn reconnector_attempts_a_dial_when_failed_members_exist() {
        let manager = Arc::new(MemberManager::new(member("local")));
        manager
            .execute(|acc| acc.authoritative_join(member("a"), crate::clock::LamportTime(1)))
            .await;
        manager
            .execute(|acc| {
                acc.authoritative_leave("a", crate::clock::LamportTime(2), false, Instant::now())
            })
            .await;

        let reconnector = CountingReconnector(AtomicUsize::new(0));
        reconnect_once(&manager, &reconnector).await;
        assert_eq!(reconnector.0.load(Ordering::SeqCst), 1);
    }
}
