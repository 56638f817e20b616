//! src/delegate.rs
//!
//! The seam between the gossip transport and the rest of the node
//! (§4.12). The transport only ever calls through `GossipDelegate`; it
//! never reaches into `MemberManager`/`QueryEngine` directly. `SerfDelegate`
//! is the concrete implementation `Serf` installs, turning transport
//! callbacks into the handler calls built up in `members::state`,
//! `events.rs`, and `query/mod.rs`.

use crate::broadcast::BroadcastQueues;
use crate::clock::LamportClock;
use crate::domain::Member;
use crate::events::SerfEvent;
use crate::keyring::SharedKeyring;
use crate::members::state::{IntentHandler, NodeEventHandler};
use crate::members::MemberManager;
use crate::query::QueryEngine;
use crate::tags::Tags;
use crate::wire::{QueryFlags, QueryMessage, SerfMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Unicast send, used to ack/respond to a query directly to its source
/// rather than via the broadcast queues. The real implementation opens a
/// short-lived connection through the gossip transport; tests substitute
/// a recording stub.
#[async_trait]
pub trait Unicast: Send + Sync {
    async fn send_to(&self, addr: std::net::IpAddr, port: u16, payload: Vec<u8>);
}

/// The hooks a gossip transport invokes against local node state. Mirrors
/// memberlist's own delegate interface: metadata for the piggy-back
/// payload, inbound user messages, outbound broadcast draining, and the
/// three authoritative lifecycle notifications.
#[async_trait]
pub trait GossipDelegate: Send + Sync {
    fn node_meta(&self, limit: usize) -> Vec<u8>;
    async fn notify_msg(&self, from: &str, payload: &[u8]);
    async fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;
    async fn notify_join(&self, member: Member);
    async fn notify_leave(&self, name: &str, graceful: bool);
    async fn notify_update(&self, member: Member);
}

/// Wires transport callbacks into the handler types built elsewhere.
/// Holds everything by `Arc`/shared handle so it can be cloned cheaply
/// into the transport layer without the transport needing to know about
/// `Serf`'s other fields.
pub struct SerfDelegate {
    pub manager: Arc<MemberManager>,
    pub member_clock: Arc<LamportClock>,
    pub event_tx: mpsc::Sender<SerfEvent>,
    pub queues: Arc<Mutex<BroadcastQueues>>,
    pub query_engine: Arc<QueryEngine>,
    pub local_name: String,
    pub local_tags: Arc<std::sync::RwLock<Tags>>,
    pub flap_timeout: Duration,
    pub recent_intent_timeout: Duration,
    pub protocol_version: u8,
    pub unicast: Arc<dyn Unicast>,
    pub keyring: SharedKeyring,
    /// Fed a `Member` whenever the transport reports a node claiming the
    /// local name with a different address (§4.8); `Serf::new` spawns a
    /// task that drains this into `Serf::resolve_name_conflict`.
    pub conflict_tx: mpsc::UnboundedSender<Member>,
    /// `Config::retransmit_mult`, used to derive each `GetBroadcasts`
    /// round's transmit-limit from the current member count (§4.4).
    pub retransmit_mult: usize,
}

impl SerfDelegate {
    fn node_handler(&self) -> NodeEventHandler<'_> {
        NodeEventHandler {
            manager: &self.manager,
            member_clock: &self.member_clock,
            event_tx: &self.event_tx,
            flap_timeout: self.flap_timeout,
        }
    }

    fn intent_handler(&self) -> IntentHandler<'_> {
        IntentHandler {
            manager: &self.manager,
            member_clock: &self.member_clock,
            event_tx: &self.event_tx,
            local_name: &self.local_name,
            recent_intent_timeout: self.recent_intent_timeout,
        }
    }

    /// Dispatches one decoded wire message. Returns `true` if the message
    /// should be rebroadcast onto the appropriate queue (the transport
    /// layer handles the actual re-enqueue since it knows the message's
    /// raw bytes; this just signals intent).
    pub async fn handle_wire_message(&self, msg: SerfMessage, raw: &[u8]) -> bool {
        match msg {
            SerfMessage::Join(m) => self.intent_handler().handle_join_intent(&m.node, m.ltime).await.rebroadcast,
            SerfMessage::Leave(m) => {
                let outcome = self.intent_handler().handle_leave_intent(&m.node, m.ltime).await;
                if outcome.refute {
                    self.refute().await;
                }
                outcome.rebroadcast
            }
            SerfMessage::Query(m) => {
                let local_tags = self.local_tags.read().unwrap().clone();
                match self.query_engine.handle_query(&m, &self.local_name, &local_tags) {
                    Some(disposition) => {
                        if disposition.should_ack {
                            self.send_query_response(&m, QueryFlags::ACK, Vec::new()).await;
                        }
                        if disposition.matched {
                            if disposition.is_internal {
                                let (primary, installed) = {
                                    let kr = self.keyring.read().unwrap();
                                    (kr.primary_key(), kr.keys())
                                };
                                let conflicting_member = if m.name == crate::query::internal::CONFLICT_QUERY {
                                    let queried_name = String::from_utf8_lossy(&m.payload).into_owned();
                                    self.manager.execute(|acc| acc.get(&queried_name).map(|info| info.member.clone())).await
                                } else {
                                    None
                                };
                                if let Some(reply) = crate::query::internal::handle(
                                    &m.name,
                                    &primary,
                                    &installed,
                                    8192,
                                    conflicting_member.as_ref(),
                                ) {
                                    self.send_query_response(&m, QueryFlags::default(), reply).await;
                                }
                            } else {
                                self.forward_query_to_user(&m).await;
                            }
                        }
                        disposition.rebroadcast
                    }
                    None => false,
                }
            }
            SerfMessage::QueryResponse(m) => {
                self.query_engine.handle_query_response(&m);
                false
            }
            SerfMessage::Relay(hdr, inner) => {
                let _ = raw;
                self.unicast.send_to(hdr.dest_addr, hdr.dest_port, inner).await;
                false
            }
            _ => false,
        }
    }

    /// Hands a matched, non-internal query to the user's event channel,
    /// and spawns a short-lived task that unicasts whatever the caller
    /// passes to `QueryEvent::respond` back to the query's origin.
    async fn forward_query_to_user(&self, m: &QueryMessage) {
        let (respond_tx, mut respond_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let _ = self
            .event_tx
            .send(SerfEvent::Query(crate::events::QueryEvent {
                id: m.id,
                ltime: m.ltime,
                name: m.name.clone(),
                payload: m.payload.clone(),
                respond: respond_tx,
            }))
            .await;

        let unicast = self.unicast.clone();
        let manager = self.manager.clone();
        let local_name = self.local_name.clone();
        let source_node = m.source_node.clone();
        let relay_factor = m.relay_factor;
        let ltime = m.ltime;
        let id = m.id;
        let dest_addr = m.addr;
        let dest_port = m.port;
        tokio::spawn(async move {
            if let Some(payload) = respond_rx.recv().await {
                let response = SerfMessage::QueryResponse(crate::wire::QueryResponseMessage {
                    ltime,
                    id,
                    from: local_name.clone(),
                    flags: QueryFlags::default(),
                    payload,
                });
                if let Ok(encoded) = response.encode() {
                    send_relayed(&*unicast, &manager, &local_name, dest_addr, dest_port, &source_node, relay_factor, encoded).await;
                }
            }
        });
    }

    async fn send_query_response(&self, m: &QueryMessage, flags: QueryFlags, payload: Vec<u8>) {
        let response = SerfMessage::QueryResponse(crate::wire::QueryResponseMessage {
            ltime: m.ltime,
            id: m.id,
            from: self.local_name.clone(),
            flags,
            payload,
        });
        if let Ok(encoded) = response.encode() {
            send_relayed(
                &*self.unicast,
                &self.manager,
                &self.local_name,
                m.addr,
                m.port,
                &m.source_node,
                m.relay_factor,
                encoded,
            )
            .await;
        }
    }

    /// Broadcasts a fresh Join intent at a newer Lamport time, overriding
    /// whatever stale Leave intent someone gossiped about the local node.
    async fn refute(&self) {
        let ltime = self.member_clock.increment();
        let msg = SerfMessage::Join(crate::wire::JoinMessage {
            ltime,
            node: self.local_name.clone(),
        });
        let Ok(encoded) = msg.encode() else { return };
        self.queues.lock().await.membership.enqueue(encoded, None);
        tracing::debug!(node = %self.local_name, "member.refute_leave");
    }
}

/// Picks up to `n` distinct alive members, excluding `local_name` and
/// `exclude`, to carry a relayed copy of a query response (§4.6's
/// `RelayFactor`).
async fn relay_targets(manager: &MemberManager, local_name: &str, exclude: &str, n: u8) -> Vec<(std::net::IpAddr, u16)> {
    use rand::seq::SliceRandom;
    if n == 0 {
        return Vec::new();
    }
    manager
        .execute(|acc| {
            let mut candidates: Vec<(std::net::IpAddr, u16)> = acc
                .list_by_status(crate::domain::MemberStatus::Alive)
                .into_iter()
                .filter(|info| info.member.name != local_name && info.member.name != exclude)
                .map(|info| (info.member.addr, info.member.port))
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(n as usize);
            candidates
        })
        .await
}

/// Sends one query response both directly to the querier and, if
/// `relay_factor` is non-zero, wrapped in a `Relay` envelope through that
/// many other alive members — whichever copy arrives first wins, since
/// `QueryEngine::handle_query_response` dedups by sender name.
#[allow(clippy::too_many_arguments)]
async fn send_relayed(
    unicast: &dyn Unicast,
    manager: &MemberManager,
    local_name: &str,
    dest_addr: std::net::IpAddr,
    dest_port: u16,
    source_node: &str,
    relay_factor: u8,
    encoded: Vec<u8>,
) {
    unicast.send_to(dest_addr, dest_port, encoded.clone()).await;
    if relay_factor == 0 {
        return;
    }
    let targets = relay_targets(manager, local_name, source_node, relay_factor).await;
    let hdr = crate::wire::RelayHeader { dest_addr, dest_port, dest_name: source_node.to_string() };
    let Ok(envelope) = SerfMessage::Relay(hdr, encoded).encode() else { return };
    for (addr, port) in targets {
        unicast.send_to(addr, port, envelope.clone()).await;
    }
}

#[async_trait]
impl GossipDelegate for SerfDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        let tags = self.local_tags.read().unwrap().clone();
        match crate::tags::encode_tags(&tags, self.protocol_version) {
            Ok(bytes) if bytes.len() <= limit => bytes,
            _ => Vec::new(),
        }
    }

    async fn notify_msg(&self, from: &str, payload: &[u8]) {
        tracing::trace!(from, len = payload.len(), "delegate.notify_msg");
    }

    async fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let member_count = self.manager.count().await;
        let retransmit_limit = crate::broadcast::retransmit_limit(self.retransmit_mult, member_count);
        self.queues.lock().await.get_broadcasts(overhead, limit, retransmit_limit)
    }

    async fn notify_join(&self, member: Member) {
        if member.name == self.local_name {
            let conflicts = self
                .manager
                .execute(|acc| {
                    acc.get(&self.local_name)
                        .map(|info| (info.member.addr, info.member.port) != (member.addr, member.port))
                        .unwrap_or(false)
                })
                .await;
            if conflicts {
                let _ = self.conflict_tx.send(member);
                return;
            }
        }
        self.node_handler().handle_join(member).await;
    }

    async fn notify_leave(&self, name: &str, graceful: bool) {
        self.node_handler().handle_leave(name, graceful).await;
    }

    async fn notify_update(&self, member: Member) {
        self.node_handler().handle_update(member).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::QueryBuffer;
    use std::net::{IpAddr, Ipv4Addr};

    fn member(name: &str) -> Member {
        Member::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), 7946)
    }

    struct NoopUnicast;

    #[async_trait]
    impl Unicast for NoopUnicast {
        async fn send_to(&self, _addr: IpAddr, _port: u16, _payload: Vec<u8>) {}
    }

    fn delegate() -> (SerfDelegate, mpsc::Receiver<SerfEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let (conflict_tx, _conflict_rx) = mpsc::unbounded_channel();
        let d = SerfDelegate {
            manager: Arc::new(MemberManager::new(member("local"))),
            member_clock: Arc::new(LamportClock::new()),
            event_tx: tx,
            queues: Arc::new(Mutex::new(BroadcastQueues::new(128))),
            query_engine: Arc::new(QueryEngine::new(128)),
            local_name: "local".into(),
            local_tags: Arc::new(std::sync::RwLock::new(Tags::new())),
            flap_timeout: Duration::from_secs(60),
            recent_intent_timeout: Duration::from_secs(300),
            protocol_version: crate::tags::TAGS_PROTOCOL_MIN,
            unicast: Arc::new(NoopUnicast),
            keyring: crate::keyring::shared(),
            conflict_tx,
            retransmit_mult: 4,
        };
        let _ = QueryBuffer::new(1);
        (d, rx)
    }

    #[tokio::test]
    async fn notify_join_creates_member_and_emits_event() {
        let (d, mut rx) = delegate();
        d.notify_join(member("a")).await;
        assert!(rx.try_recv().is_ok());
        assert_eq!(d.manager.count().await, 2);
    }

    #[tokio::test]
    async fn notify_join_claiming_the_local_name_with_a_different_address_is_routed_as_a_conflict() {
        let (tx, rx) = mpsc::channel(16);
        let (conflict_tx, mut conflict_rx) = mpsc::unbounded_channel();
        let d = SerfDelegate {
            manager: Arc::new(MemberManager::new(member("local"))),
            member_clock: Arc::new(LamportClock::new()),
            event_tx: tx,
            queues: Arc::new(Mutex::new(BroadcastQueues::new(128))),
            query_engine: Arc::new(QueryEngine::new(128)),
            local_name: "local".into(),
            local_tags: Arc::new(std::sync::RwLock::new(Tags::new())),
            flap_timeout: Duration::from_secs(60),
            recent_intent_timeout: Duration::from_secs(300),
            protocol_version: crate::tags::TAGS_PROTOCOL_MIN,
            unicast: Arc::new(NoopUnicast),
            keyring: crate::keyring::shared(),
            conflict_tx,
            retransmit_mult: 4,
        };
        drop(rx);

        let impostor = Member::new("local", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)), 7946);
        d.notify_join(impostor.clone()).await;

        assert_eq!(d.manager.count().await, 1, "the conflicting claim must not overwrite the local record");
        let routed = conflict_rx.try_recv().unwrap();
        assert_eq!(routed.addr, impostor.addr);
    }

    #[tokio::test]
    async fn node_meta_encodes_current_tags() {
        let (d, _rx) = delegate();
        let bytes = d.node_meta(4096);
        let decoded = crate::tags::decode_tags(&bytes).unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn get_broadcasts_retransmits_an_item_across_multiple_rounds() {
        let (d, _rx) = delegate();
        d.queues.lock().await.event.enqueue(vec![1, 2, 3], None);

        let limit = crate::broadcast::retransmit_limit(d.retransmit_mult, d.manager.count().await);
        assert!(limit > 1, "a single-member cluster should still get more than one retransmit round");

        for round in 0..limit {
            let drained = d.get_broadcasts(0, 1024).await;
            assert_eq!(drained, vec![vec![1, 2, 3]], "round {round} must still carry the item");
        }
        assert!(d.get_broadcasts(0, 1024).await.is_empty(), "item must be gone once its quota is exhausted");
    }

    #[tokio::test]
    async fn leave_intent_for_local_node_triggers_refute_without_mutation() {
        let (d, _rx) = delegate();
        let msg = SerfMessage::Leave(crate::wire::LeaveMessage {
            ltime: crate::clock::LamportTime(1),
            node: "local".into(),
            prune: false,
        });
        let raw = msg.encode().unwrap();
        let rebroadcast = d.handle_wire_message(msg, &raw).await;
        assert!(!rebroadcast);
    }

    struct RecordingUnicast {
        sent: Mutex<Vec<(IpAddr, u16, Vec<u8>)>>,
    }

    #[async_trait]
    impl Unicast for RecordingUnicast {
        async fn send_to(&self, addr: IpAddr, port: u16, payload: Vec<u8>) {
            self.sent.lock().await.push((addr, port, payload));
        }
    }

    #[tokio::test]
    async fn relay_message_is_forwarded_to_its_final_destination() {
        let (mut d, _rx) = delegate();
        let recorder = Arc::new(RecordingUnicast { sent: Mutex::new(Vec::new()) });
        d.unicast = recorder.clone();

        let dest_addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        let hdr = crate::wire::RelayHeader { dest_addr, dest_port: 4242, dest_name: "origin".into() };
        let inner = b"query-response-bytes".to_vec();
        let msg = SerfMessage::Relay(hdr, inner.clone());
        let raw = msg.encode().unwrap();
        d.handle_wire_message(msg, &raw).await;

        let sent = recorder.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (dest_addr, 4242, inner));
    }

    #[tokio::test]
    async fn query_response_with_relay_factor_also_sends_relay_copies() {
        let (mut d, _rx) = delegate();
        d.manager.execute(|acc| acc.insert_alive(member("peer"), crate::clock::LamportTime(1))).await;
        let recorder = Arc::new(RecordingUnicast { sent: Mutex::new(Vec::new()) });
        d.unicast = recorder.clone();

        let query = QueryMessage {
            ltime: crate::clock::LamportTime(1),
            id: 7,
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port: 9000,
            source_node: "origin".into(),
            filters: Vec::new(),
            flags: QueryFlags::default(),
            relay_factor: 1,
            timeout_ms: 1000,
            name: "ping".into(),
            payload: Vec::new(),
        };
        d.send_query_response(&query, QueryFlags::default(), b"pong".to_vec()).await;

        let sent = recorder.sent.lock().await;
        assert_eq!(sent.len(), 2, "expected a direct send and one relay copy");
        assert!(sent.iter().any(|(addr, port, _)| *addr == query.addr && *port == query.port));
    }
}
