//! src/pushpull.rs
//!
//! State exchange run once per new connection (§4.11): each side sends its
//! full view of membership, recent events, and clocks so gossip doesn't
//! have to wait for the slower epidemic convergence to catch a newly
//! joined node up. `local_state` builds the outgoing message;
//! `merge_remote_state` reconciles an incoming one against the local
//! registry the same way a stream of individual Join/Leave/UserEvent
//! messages would, just batched.

use crate::clock::{LamportClock, LamportTime};
use crate::domain::{Member, MemberStatus};
use crate::events::{EventBuffer, SerfEvent, UserEvent};
use crate::members::state::{IntentHandler, NodeEventHandler};
use crate::members::MemberManager;
use crate::wire::PushPullMessage;
use std::time::Duration;
use tokio::sync::mpsc;

/// Builds the outgoing push/pull payload from current local state.
/// `join` mirrors the distilled spec's flag distinguishing an initial
/// join exchange (which may trigger a name-conflict check on the remote
/// side) from a routine anti-entropy exchange.
pub async fn local_state(
    manager: &MemberManager,
    local_name: &str,
    local_addr: std::net::IpAddr,
    local_port: u16,
    is_reply: bool,
    member_clock: LamportTime,
    event_clock: LamportTime,
    query_clock: LamportTime,
    events: &std::sync::Mutex<EventBuffer>,
) -> PushPullMessage {
    let (status_ltimes, left_members) = manager
        .execute(|acc| {
            let status_ltimes = acc
                .list_all()
                .into_iter()
                .map(|info| (info.member.name.clone(), info.status_ltime))
                .collect();
            let left_members = acc
                .left_names()
                .to_vec();
            (status_ltimes, left_members)
        })
        .await;

    PushPullMessage {
        ltime: member_clock,
        source_node: local_name.to_string(),
        source_addr: local_addr,
        source_port: local_port,
        is_reply,
        status_ltimes,
        left_members,
        event_ltime: event_clock,
        events: events.lock().unwrap().snapshot(),
        query_ltime: query_clock,
    }
}

/// Reconciles an inbound `PushPullMessage`. Per-member status ltimes are
/// applied through the same monotonic `apply_intent_status` gate a
/// gossiped Leave intent would use — push/pull never resurrects a member;
/// that still requires the authoritative join path via `node_handler`.
///
/// The sender identifies itself (`source_node`/`source_addr`/`source_port`)
/// since this crate's minimal transport has no prior handshake that would
/// otherwise tell us who is on the other end of the connection; if the
/// sender is unknown locally, it is created via the authoritative join
/// path, same as a direct transport connection callback would.
///
/// Every other remote member named in `status_ltimes` is reconciled too:
/// members it reports as left are fed through the Leave-intent path, and
/// every other (i.e. still-alive, from the remote's point of view) member
/// is fed through the Join-intent path so a node catching up via push/pull
/// learns about peers it has never heard gossip about directly, not just
/// the node on the other end of the connection. Finally, `remote.events`
/// (its recent `UserEventCollection` history) is replayed through the same
/// dedup/emit path a gossiped `UserEvent` message would take, so push/pull
/// catches a joining node up on events it missed.
#[allow(clippy::too_many_arguments)]
pub async fn merge_remote_state(
    remote: &PushPullMessage,
    manager: &MemberManager,
    member_clock: &LamportClock,
    event_tx: &mpsc::Sender<SerfEvent>,
    local_name: &str,
    recent_intent_timeout: Duration,
    event_clock: &LamportClock,
    event_buffer: &std::sync::Mutex<EventBuffer>,
) {
    let node_handler = NodeEventHandler {
        manager,
        member_clock,
        event_tx,
        flap_timeout: Duration::from_secs(60),
    };

    if remote.source_node != local_name {
        let known = manager.execute(|acc| acc.get(&remote.source_node).is_some()).await;
        if !known {
            let mut member = Member::new(remote.source_node.clone(), remote.source_addr, remote.source_port);
            member.status = MemberStatus::Alive;
            node_handler.handle_join(member).await;
        }
    }

    let intent_handler = IntentHandler {
        manager,
        member_clock,
        event_tx,
        local_name,
        recent_intent_timeout,
    };

    for (name, ltime) in &remote.status_ltimes {
        if name == local_name {
            continue;
        }
        if remote.left_members.contains(name) {
            intent_handler.handle_leave_intent(name, *ltime).await;
        } else if name != &remote.source_node {
            intent_handler.handle_join_intent(name, *ltime).await;
        }
    }

    for collection in &remote.events {
        event_clock.witness(collection.ltime);
        let clock_time = event_clock.time();
        for (name, payload) in &collection.events {
            let fresh = event_buffer.lock().unwrap().observe(clock_time, collection.ltime, name, payload);
            if fresh {
                let _ = event_tx
                    .send(SerfEvent::User(UserEvent {
                        ltime: collection.ltime,
                        name: name.clone(),
                        payload: payload.clone(),
                        coalesce: false,
                    }))
                    .await;
            }
        }
    }
}
