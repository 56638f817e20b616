//! src/members/state.rs
//!
//! The two handlers that drive the per-member finite-state machine
//! described in the distilled spec (§4.3). `NodeEventHandler` is
//! authoritative: it processes the gossip transport's own join/leave/update
//! callbacks and may resurrect a Failed/Left member back to Alive.
//! `IntentHandler` is non-authoritative: it processes gossiped join/leave
//! intents, which may only advance a member forward by Lamport time.
//!
//! Both handlers, after a state change, emit a `MemberEvent` for downstream
//! delivery — neither one performs the rebroadcast itself; their callers
//! (the delegate) use the returned "rebroadcast?" signal to route the
//! message onto (or keep it off of) the membership broadcast queue.

use crate::clock::{LamportClock, LamportTime};
use crate::domain::{Member, MemberStatus};
use crate::events::{MemberEvent, MemberEventKind, SerfEvent};
use crate::members::intent::IntentKind;
use crate::members::{MemberManager, Transition};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn emit(event_tx: &mpsc::Sender<SerfEvent>, kind: MemberEventKind, member: Member) {
    let _ = event_tx.try_send(SerfEvent::Member(MemberEvent {
        kind,
        members: vec![member],
    }));
}

/// Processes authoritative transport callbacks (`NotifyJoin`/`NotifyLeave`/
/// `NotifyUpdate`).
pub struct NodeEventHandler<'a> {
    pub manager: &'a MemberManager,
    pub member_clock: &'a LamportClock,
    pub event_tx: &'a mpsc::Sender<SerfEvent>,
    pub flap_timeout: Duration,
}

impl<'a> NodeEventHandler<'a> {
    pub async fn handle_join(&self, member: Member) {
        let ltime = self.member_clock.increment();
        let name = member.name.clone();

        let (transition, flapped) = self
            .manager
            .execute(|acc| {
                let was_failed = acc
                    .get(&name)
                    .map(|info| info.member.status == MemberStatus::Failed)
                    .unwrap_or(false);
                let leave_time = acc.get(&name).and_then(|info| info.leave_time);
                let transition = acc.authoritative_join(member.clone(), ltime);
                let flapped = was_failed
                    && transition == Transition::Resurrected
                    && leave_time
                        .map(|lt| lt.elapsed() < self.flap_timeout)
                        .unwrap_or(false);
                (transition, flapped)
            })
            .await;

        if flapped {
            tracing::warn!(member = %name, "member.flap");
        }

        match transition {
            Transition::Created | Transition::Resurrected => {
                emit(self.event_tx, MemberEventKind::Join, member);
            }
            Transition::Updated => {
                emit(self.event_tx, MemberEventKind::Update, member);
            }
            Transition::NoChange => {}
        }
    }

    pub async fn handle_update(&self, member: Member) {
        let name = member.name.clone();
        let updated = self
            .manager
            .execute(|acc| acc.update_tags(&name, member.tags.clone()))
            .await;
        if updated {
            emit(self.event_tx, MemberEventKind::Update, member);
        }
    }

    /// `graceful` reflects the transport's reason code for the departure:
    /// a "left" notification is graceful, a "dead" notification is not.
    pub async fn handle_leave(&self, name: &str, graceful: bool) {
        let ltime = self.member_clock.increment();
        let now = Instant::now();

        let result = self
            .manager
            .execute(|acc| {
                let member_snapshot = acc.get(name).map(|info| info.member.clone());
                let previous = acc.authoritative_leave(name, ltime, graceful, now);
                (previous, member_snapshot)
            })
            .await;

        let (previous, member_snapshot) = result;
        let Some(_previous) = previous else { return };
        let Some(mut member) = member_snapshot else {
            return;
        };
        member.status = if graceful {
            MemberStatus::Left
        } else {
            MemberStatus::Failed
        };

        let kind = if graceful {
            MemberEventKind::Leave
        } else {
            MemberEventKind::Failed
        };
        emit(self.event_tx, kind, member);
    }
}

/// Outcome of processing a single gossiped intent: whether the delegate
/// should rebroadcast it, and — for a Leave intent naming the local node —
/// whether a refutation Join should be issued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntentOutcome {
    pub rebroadcast: bool,
    pub refute: bool,
}

/// Processes non-authoritative gossiped join/leave intents.
pub struct IntentHandler<'a> {
    pub manager: &'a MemberManager,
    pub member_clock: &'a LamportClock,
    pub event_tx: &'a mpsc::Sender<SerfEvent>,
    pub local_name: &'a str,
    pub recent_intent_timeout: Duration,
}

impl<'a> IntentHandler<'a> {
    pub async fn handle_join_intent(&self, node: &str, ltime: LamportTime) -> IntentOutcome {
        self.member_clock.witness(ltime);

        let known = self.manager.execute(|acc| acc.get(node).is_some()).await;
        if !known {
            let recorded = self
                .manager
                .execute_intents(|buf| {
                    buf.reap(self.recent_intent_timeout);
                    buf.record(node, IntentKind::Join, ltime)
                })
                .await;
            return IntentOutcome {
                rebroadcast: recorded,
                refute: false,
            };
        }

        // Advances status_ltime only; resurrection from Failed/Left requires
        // an authoritative callback, never a gossiped intent. Advancing the
        // ltime here (rather than just witnessing it) matters: without it a
        // later intermediate-ltime Leave intent would still look "newer"
        // than the member's stale status_ltime and get applied out of order.
        let now = Instant::now();
        let applied = self
            .manager
            .execute(|acc| {
                let Some(status) = acc.get(node).map(|info| info.member.status) else {
                    return false;
                };
                if matches!(status, MemberStatus::Failed | MemberStatus::Left) {
                    return false;
                }
                acc.apply_intent_status(node, status, ltime, now)
            })
            .await;

        IntentOutcome {
            rebroadcast: applied,
            refute: false,
        }
    }

    pub async fn handle_leave_intent(&self, node: &str, ltime: LamportTime) -> IntentOutcome {
        self.member_clock.witness(ltime);

        if node == self.local_name {
            // Someone gossiped that we left, but we're still here: refute
            // by broadcasting a fresh Join intent at a newer Lamport time.
            return IntentOutcome {
                rebroadcast: false,
                refute: true,
            };
        }

        let known = self.manager.execute(|acc| acc.get(node).is_some()).await;
        if !known {
            let recorded = self
                .manager
                .execute_intents(|buf| {
                    buf.reap(self.recent_intent_timeout);
                    buf.record(node, IntentKind::Leave, ltime)
                })
                .await;
            return IntentOutcome {
                rebroadcast: recorded,
                refute: false,
            };
        }

        let now = Instant::now();
        let (applied, member_snapshot) = self
            .manager
            .execute(|acc| {
                let Some(info) = acc.get(node) else {
                    return (false, None);
                };
                if ltime <= info.status_ltime {
                    return (false, None);
                }
                // Resolved Open Question: a Leave intent for a member
                // already in Leaving (or Failed, i.e. a remote
                // "remove-failed-node") moves it to Left immediately,
                // rather than waiting for a separate authoritative callback.
                let applied = acc.apply_intent_status(node, MemberStatus::Left, ltime, now);
                let snapshot = if applied {
                    acc.get(node).map(|i| i.member.clone())
                } else {
                    None
                };
                (applied, snapshot)
            })
            .await;

        if applied {
            if let Some(member) = member_snapshot {
                emit(self.event_tx, MemberEventKind::Leave, member);
            }
        }

        IntentOutcome {
            rebroadcast: applied,
            refute: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::members::MemberManager;
    use std::net::{IpAddr, Ipv4Addr};

    fn member(name: &str) -> Member {
        Member::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), 7946)
    }

    #[tokio::test]
    async fn node_event_handler_emits_join_for_new_member() {
        let manager = MemberManager::new(member("local"));
        let clock = LamportClock::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handler = NodeEventHandler {
            manager: &manager,
            member_clock: &clock,
            event_tx: &tx,
            flap_timeout: Duration::from_secs(60),
        };
        handler.handle_join(member("a")).await;
        let event = rx.try_recv().unwrap();
        match event {
            SerfEvent::Member(m) => assert_eq!(m.kind, MemberEventKind::Join),
            _ => panic!("wrong event"),
        }
    }

    #[tokio::test]
    async fn node_event_handler_marks_failed_on_dead_leave() {
        let manager = MemberManager::new(member("local"));
        let clock = LamportClock::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handler = NodeEventHandler {
            manager: &manager,
            member_clock: &clock,
            event_tx: &tx,
            flap_timeout: Duration::from_secs(60),
        };
        handler.handle_join(member("a")).await;
        rx.try_recv().unwrap();
        handler.handle_leave("a", false).await;
        let event = rx.try_recv().unwrap();
        match event {
            SerfEvent::Member(m) => assert_eq!(m.kind, MemberEventKind::Failed),
            _ => panic!("wrong event"),
        }
    }

    #[tokio::test]
    async fn intent_handler_buffers_latent_intent_for_unknown_node() {
        let manager = MemberManager::new(member("local"));
        let clock = LamportClock::new();
        let (tx, _rx) = mpsc::channel(8);
        let handler = IntentHandler {
            manager: &manager,
            member_clock: &clock,
            event_tx: &tx,
            local_name: "local",
            recent_intent_timeout: Duration::from_secs(300),
        };
        let outcome = handler.handle_join_intent("ghost", LamportTime(1)).await;
        assert!(outcome.rebroadcast);
        let buffered = manager.execute_intents(|buf| buf.peek("ghost").is_some()).await;
        assert!(buffered);
    }

    #[tokio::test]
    async fn intent_handler_refutes_leave_of_local_node() {
        let manager = MemberManager::new(member("local"));
        let clock = LamportClock::new();
        let (tx, _rx) = mpsc::channel(8);
        let handler = IntentHandler {
            manager: &manager,
            member_clock: &clock,
            event_tx: &tx,
            local_name: "local",
            recent_intent_timeout: Duration::from_secs(300),
        };
        let outcome = handler.handle_leave_intent("local", LamportTime(5)).await;
        assert!(outcome.refute);
        assert!(!outcome.rebroadcast);
    }

    #[tokio::test]
    async fn intent_handler_rejects_non_advancing_ltime() {
        let manager = MemberManager::new(member("local"));
        let clock = LamportClock::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handler_events = NodeEventHandler {
            manager: &manager,
            member_clock: &clock,
            event_tx: &tx,
            flap_timeout: Duration::from_secs(60),
        };
        handler_events.handle_join(member("a")).await;
        rx.try_recv().unwrap();

        let handler = IntentHandler {
            manager: &manager,
            member_clock: &clock,
            event_tx: &tx,
            local_name: "local",
            recent_intent_timeout: Duration::from_secs(300),
        };
        let outcome = handler.handle_leave_intent("a", LamportTime(0)).await;
        assert!(!outcome.rebroadcast);
    }
}
