//! src/serf.rs
//!
//! The top-level node: owns every subsystem (registry, clocks, broadcast
//! queues, query engine, coordinate client, snapshotter, gossip transport,
//! failure detector) and exposes the public operations a caller or the RPC
//! server drives (§4.1). `Serf::new` wires everything up and spawns the
//! background tasks; the returned handle is cheap to clone and share.

use crate::background::{self, ReaperConfig, Reconnector};
use crate::broadcast::BroadcastQueues;
use crate::clock::{LamportClock, LamportTime};
use crate::coordinate::{Coordinate, CoordinateClient};
use crate::delegate::{SerfDelegate, Unicast};
use crate::domain::{Member, MemberStatus};
use crate::error::{Error, Result};
use crate::events::{CoalesceConfig, Coalescer, EventBuffer, MemberEvent, MemberEventKind, SerfEvent, UserEvent};
use crate::keyring::{self, SharedKeyring};
use crate::members::state::NodeEventHandler;
use crate::members::MemberManager;
use crate::pushpull;
use crate::query::{self, QueryEngine, QueryHandle, QueryParam};
use crate::snapshot::{self, Snapshotter};
use crate::tags::Tags;
use crate::transport::probe::{FailureObserver, Prober};
use crate::transport::{ConnectionEvent, InboundMessage, Transport, TransportHandle};
use crate::wire::{JoinMessage, LeaveMessage, MessageType, SerfMessage, UserEventMessage};
use crate::Config;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// How many consecutive missed pings before `Prober` calls a member dead.
/// Not exposed in `Config`; the original's own default is itself a fixed
/// constant rather than an operator tunable.
const PROBE_MISSED_THRESHOLD: u32 = 3;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// The running node. Every field is either already internally synchronized
/// or cheap to clone, so `Serf` is handed around as a plain `Arc<Serf>`.
pub struct Serf {
    config: Config,
    local_name: String,
    local_addr: IpAddr,
    local_port: u16,
    manager: Arc<MemberManager>,
    member_clock: Arc<LamportClock>,
    event_clock: Arc<LamportClock>,
    event_buffer: Arc<StdMutex<EventBuffer>>,
    queues: Arc<Mutex<BroadcastQueues>>,
    query_engine: Arc<QueryEngine>,
    coordinate: Option<Arc<Mutex<CoordinateClient>>>,
    prober: Arc<Prober>,
    snapshotter: Arc<dyn Snapshotter>,
    transport: TransportHandle,
    local_tags: Arc<StdRwLock<Tags>>,
    keyring: SharedKeyring,
    internal_event_tx: mpsc::Sender<SerfEvent>,
    delegate: Arc<SerfDelegate>,
    shutdown: CancellationToken,
}

struct TransportUnicast(TransportHandle);

#[async_trait]
impl Unicast for TransportUnicast {
    async fn send_to(&self, addr: IpAddr, port: u16, payload: Vec<u8>) {
        self.0.send(SocketAddr::new(addr, port), payload).await;
    }
}

/// Routes the probe loop's dead-node notification into the same
/// authoritative leave path a real transport's disconnect callback would
/// use, with `graceful = false`.
struct ProbeFailureObserver {
    manager: Arc<MemberManager>,
    member_clock: Arc<LamportClock>,
    event_tx: mpsc::Sender<SerfEvent>,
    flap_timeout: Duration,
}

#[async_trait]
impl FailureObserver for ProbeFailureObserver {
    async fn notify_failed(&self, name: &str) {
        let handler = NodeEventHandler {
            manager: &self.manager,
            member_clock: &self.member_clock,
            event_tx: &self.event_tx,
            flap_timeout: self.flap_timeout,
        };
        handler.handle_leave(name, false).await;
    }
}

/// Nudges a reconnect attempt at a Failed member by sending a probe ping;
/// the registry only transitions once the transport actually reports a
/// fresh connection (or a push/pull exchange completes), mirroring the
/// distilled spec's own separation between "dial attempted" and
/// "authoritatively alive again".
struct TransportReconnector {
    transport: TransportHandle,
}

#[async_trait]
impl Reconnector for TransportReconnector {
    async fn try_connect(&self, addr: IpAddr, port: u16) -> bool {
        let frame = vec![crate::transport::probe::PING_MARKER];
        self.transport.send(SocketAddr::new(addr, port), frame).await
    }
}

impl Serf {
    /// Builds and starts every subsystem, returning the shared handle and
    /// the channel callers read member/user/query events from.
    pub async fn new(config: Config) -> Result<(Arc<Serf>, mpsc::Receiver<SerfEvent>)> {
        if config.node_name.is_empty() {
            return Err(Error::EmptyNodeName);
        }

        let local_name = config.node_name.clone();
        let advertise = config.advertise_or_bind();
        let local_addr = advertise.ip();
        let local_port = advertise.port();

        let local_member = Member::new(local_name.clone(), local_addr, local_port);
        let manager = Arc::new(MemberManager::new(local_member));
        let member_clock = Arc::new(LamportClock::new());
        let event_clock = Arc::new(LamportClock::new());
        let event_buffer = Arc::new(StdMutex::new(EventBuffer::new(config.event_buffer_size)));
        let queues = Arc::new(Mutex::new(BroadcastQueues::new(config.max_queue_depth)));
        let query_engine = Arc::new(QueryEngine::new(config.query_buffer_size));
        let coordinate = if config.disable_coordinates {
            None
        } else {
            Some(Arc::new(Mutex::new(CoordinateClient::new())))
        };
        let probe_coordinate = coordinate.clone().unwrap_or_else(|| Arc::new(Mutex::new(CoordinateClient::new())));

        let snapshot_path = config.snapshot_path.as_ref().and_then(|p| p.to_str());
        let snapshotter: Arc<dyn Snapshotter> = Arc::from(snapshot::build(snapshot_path).await?);
        member_clock.witness(snapshotter.last_clock().await);
        event_clock.witness(snapshotter.last_event_clock().await);
        query_engine.clock().witness(snapshotter.last_query_clock().await);

        let local_tags: Arc<StdRwLock<Tags>> = Arc::new(StdRwLock::new(config.tags.clone()));
        let keyring = keyring::shared();

        let (command_tx, command_rx) = mpsc::channel(256);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(1024);
        let (conn_event_tx, mut conn_event_rx) = mpsc::channel::<ConnectionEvent>(256);

        let transport = Transport::new(
            config.bind_addr,
            config.bootstrap_peers.clone(),
            command_rx,
            inbound_tx,
            conn_event_tx,
        )?;
        let transport_handle = TransportHandle::new(command_tx);

        let shutdown = CancellationToken::new();
        tokio::spawn(transport.run(shutdown.clone()));

        let (internal_tx, mut internal_rx) = mpsc::channel::<SerfEvent>(1024);
        let (user_tx, user_rx) = mpsc::channel::<SerfEvent>(1024);

        let member_coalesce = CoalesceConfig {
            period: ms(config.coalesce_period_ms),
            quiescent: ms(config.quiescent_period_ms),
        };
        let user_coalesce = CoalesceConfig {
            period: ms(config.user_coalesce_period_ms),
            quiescent: ms(config.user_quiescent_period_ms),
        };
        let member_ingress = Coalescer::spawn(member_coalesce, user_tx.clone(), shutdown.clone());
        let user_ingress = Coalescer::spawn(user_coalesce, user_tx.clone(), shutdown.clone());

        tokio::spawn({
            let shutdown = shutdown.clone();
            let user_tx = user_tx.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        maybe = internal_rx.recv() => {
                            let Some(event) = maybe else { break };
                            let routed = match &event {
                                SerfEvent::Member(_) => member_ingress.as_ref(),
                                SerfEvent::User(_) => user_ingress.as_ref(),
                                SerfEvent::Query(_) => None,
                            };
                            let _ = match routed {
                                Some(tx) => tx.send(event).await,
                                None => user_tx.send(event).await,
                            };
                        }
                    }
                }
            }
        });

        let (conflict_tx, mut conflict_rx) = mpsc::unbounded_channel::<Member>();

        let delegate = Arc::new(SerfDelegate {
            manager: manager.clone(),
            member_clock: member_clock.clone(),
            event_tx: internal_tx.clone(),
            queues: queues.clone(),
            query_engine: query_engine.clone(),
            local_name: local_name.clone(),
            local_tags: local_tags.clone(),
            flap_timeout: ms(config.flap_timeout_ms),
            recent_intent_timeout: ms(config.recent_intent_timeout_ms),
            protocol_version: crate::tags::TAGS_PROTOCOL_MIN,
            unicast: Arc::new(TransportUnicast(transport_handle.clone())),
            keyring: keyring.clone(),
            conflict_tx,
            retransmit_mult: config.retransmit_mult,
        });

        let prober = Arc::new(Prober::new(
            manager.clone(),
            transport_handle.clone(),
            local_name.clone(),
            PROBE_MISSED_THRESHOLD,
            ms(config.gossip_interval_ms * 2),
            probe_coordinate,
        ));
        let observer: Arc<dyn FailureObserver> = Arc::new(ProbeFailureObserver {
            manager: manager.clone(),
            member_clock: member_clock.clone(),
            event_tx: internal_tx.clone(),
            flap_timeout: ms(config.flap_timeout_ms),
        });
        prober.clone().spawn(ms(config.gossip_interval_ms), observer, shutdown.clone());

        background::spawn_reaper(
            manager.clone(),
            ReaperConfig {
                interval: ms(config.reap_interval_ms),
                tombstone_timeout: ms(config.tombstone_timeout_ms),
                reconnect_timeout: ms(config.reconnect_timeout_ms),
            },
            internal_tx.clone(),
            shutdown.clone(),
        );
        background::spawn_reconnector(
            manager.clone(),
            Arc::new(TransportReconnector { transport: transport_handle.clone() }),
            ms(config.reconnect_interval_ms),
            shutdown.clone(),
        );
        background::spawn_queue_monitor(
            queues.clone(),
            ms(config.queue_check_interval_ms),
            config.queue_depth_warning,
            shutdown.clone(),
        );

        // Auto-rejoin: dial every peer the last snapshot saw alive, unless
        // this node left gracefully before its last shutdown.
        if !snapshotter.left().await {
            let remembered = snapshotter.alive_nodes().await;
            if !remembered.is_empty() {
                let addrs: Vec<SocketAddr> = remembered.into_iter().map(|(_, addr)| addr).collect();
                let rejoin_tx = transport_handle.clone();
                let manager_rejoin = manager.clone();
                let local_name_rejoin = local_name.clone();
                let event_clock_rejoin = event_clock.clone();
                let query_engine_rejoin = query_engine.clone();
                let event_buffer_rejoin = event_buffer.clone();
                let member_clock_rejoin = member_clock.clone();
                tokio::spawn(async move {
                    for addr in addrs {
                        let msg = pushpull::local_state(
                            &manager_rejoin,
                            &local_name_rejoin,
                            local_addr,
                            local_port,
                            false,
                            member_clock_rejoin.time(),
                            event_clock_rejoin.time(),
                            query_engine_rejoin.clock().time(),
                            &event_buffer_rejoin,
                        )
                        .await;
                        if let Ok(bytes) = SerfMessage::PushPull(msg).encode() {
                            rejoin_tx.send(addr, bytes).await;
                        }
                    }
                });
            }
        }

        let serf = Arc::new(Serf {
            config,
            local_name: local_name.clone(),
            local_addr,
            local_port,
            manager: manager.clone(),
            member_clock: member_clock.clone(),
            event_clock: event_clock.clone(),
            event_buffer: event_buffer.clone(),
            queues: queues.clone(),
            query_engine: query_engine.clone(),
            coordinate,
            prober: prober.clone(),
            snapshotter: snapshotter.clone(),
            transport: transport_handle.clone(),
            local_tags,
            keyring,
            internal_event_tx: internal_tx.clone(),
            delegate: delegate.clone(),
            shutdown: shutdown.clone(),
        });

        // The ingestion loop: everything the transport hands us, split
        // between probe frames, push/pull exchanges (handled here directly
        // since they touch event/query clocks the delegate doesn't own),
        // and everything else (routed through the delegate).
        tokio::spawn({
            let serf = serf.clone();
            let prober = prober.clone();
            let recent_intent_timeout = ms(serf.config.recent_intent_timeout_ms);
            async move {
                loop {
                    tokio::select! {
                        _ = serf.shutdown.cancelled() => break,
                        Some(inbound) = inbound_rx.recv() => {
                            if prober.handle_inbound(inbound.peer_addr, &inbound.bytes).await {
                                continue;
                            }
                            serf.handle_inbound_wire(inbound, recent_intent_timeout).await;
                        }
                        Some(event) = conn_event_rx.recv() => {
                            match event {
                                ConnectionEvent::PeerConnected { peer_addr } => {
                                    tracing::trace!(peer = %peer_addr, "serf.peer_connected");
                                }
                                ConnectionEvent::PeerDisconnected { peer_addr } => {
                                    tracing::trace!(peer = %peer_addr, "serf.peer_disconnected");
                                }
                            }
                        }
                        else => break,
                    }
                }
            }
        });

        // Drains name-conflict notifications from the delegate and runs
        // the §4.8 resolution procedure against each one in turn.
        tokio::spawn({
            let serf = serf.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = serf.shutdown.cancelled() => break,
                        maybe = conflict_rx.recv() => {
                            let Some(conflicting) = maybe else { break };
                            serf.resolve_name_conflict(conflicting).await;
                        }
                    }
                }
            }
        });

        // Periodically persists the clocks and alive-member set so a
        // restart doesn't need an operator-supplied peer list.
        tokio::spawn({
            let serf = serf.clone();
            let interval = ms(serf.config.reap_interval_ms.max(1000));
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = serf.shutdown.cancelled() => break,
                        _ = ticker.tick() => serf.persist_snapshot().await,
                    }
                }
            }
        });

        Ok((serf, user_rx))
    }

    async fn persist_snapshot(&self) {
        self.snapshotter
            .record_clock(self.member_clock.time(), self.event_clock.time(), self.query_engine.clock().time())
            .await;
        let alive = self
            .manager
            .execute(|acc| {
                acc.list_by_status(MemberStatus::Alive)
                    .into_iter()
                    .filter(|info| info.member.name != self.local_name)
                    .map(|info| (info.member.name.clone(), SocketAddr::new(info.member.addr, info.member.port)))
                    .collect::<Vec<_>>()
            })
            .await;
        for (name, addr) in alive {
            self.snapshotter.record_member(&name, addr, true).await;
        }
    }

    async fn handle_inbound_wire(&self, inbound: InboundMessage, recent_intent_timeout: Duration) {
        match SerfMessage::decode(&inbound.bytes) {
            Ok(SerfMessage::PushPull(pp)) => {
                let is_reply = pp.is_reply;
                pushpull::merge_remote_state(
                    &pp,
                    &self.manager,
                    &self.member_clock,
                    &self.internal_event_tx,
                    &self.local_name,
                    recent_intent_timeout,
                    &self.event_clock,
                    &self.event_buffer,
                )
                .await;
                self.event_clock.witness(pp.event_ltime);
                self.query_engine.clock().witness(pp.query_ltime);

                if !is_reply {
                    let reply = pushpull::local_state(
                        &self.manager,
                        &self.local_name,
                        self.local_addr,
                        self.local_port,
                        true,
                        self.member_clock.time(),
                        self.event_clock.time(),
                        self.query_engine.clock().time(),
                        &self.event_buffer,
                    )
                    .await;
                    if let Ok(bytes) = SerfMessage::PushPull(reply).encode() {
                        self.transport.send(inbound.peer_addr, bytes).await;
                    }
                }
            }
            Ok(SerfMessage::UserEvent(ue)) => {
                self.event_clock.witness(ue.ltime);
                let clock_time = self.event_clock.time();
                let fresh = self
                    .event_buffer
                    .lock()
                    .unwrap()
                    .observe(clock_time, ue.ltime, &ue.name, &ue.payload);
                if fresh {
                    let _ = self
                        .internal_event_tx
                        .send(SerfEvent::User(UserEvent {
                            ltime: ue.ltime,
                            name: ue.name.clone(),
                            payload: ue.payload.clone(),
                            coalesce: ue.coalesce,
                        }))
                        .await;
                    self.queues.lock().await.event.enqueue(inbound.bytes, None);
                }
            }
            Ok(msg) => {
                let mtype = msg.message_type();
                let raw = inbound.bytes;
                let rebroadcast = self.delegate.handle_wire_message(msg, &raw).await;
                if rebroadcast {
                    let mut q = self.queues.lock().await;
                    match mtype {
                        MessageType::Join | MessageType::Leave => {
                            q.membership.enqueue(raw, None);
                        }
                        MessageType::Query | MessageType::QueryResponse => {
                            q.query.enqueue(raw, None);
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, peer = %inbound.peer_addr, "serf.decode_failed");
            }
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Sends our current state to each address so the receiving side can
    /// authoritatively learn about us; the receiver replies with its own
    /// state over the same exchange (see `handle_inbound_wire`).
    pub async fn join(&self, addrs: &[SocketAddr]) -> Result<usize> {
        if addrs.is_empty() {
            return Err(Error::EmptyJoinList);
        }

        let mut joined = 0;
        for &addr in addrs {
            let msg = pushpull::local_state(
                &self.manager,
                &self.local_name,
                self.local_addr,
                self.local_port,
                false,
                self.member_clock.time(),
                self.event_clock.time(),
                self.query_engine.clock().time(),
                &self.event_buffer,
            )
            .await;
            let Ok(bytes) = SerfMessage::PushPull(msg).encode() else { continue };
            if self.transport.send(addr, bytes).await {
                joined += 1;
            }
        }
        Ok(joined)
    }

    /// Gracefully departs the cluster: broadcasts a Leave intent for the
    /// local node, marks the local record accordingly, and records the
    /// departure in the snapshot so a restart doesn't auto-rejoin.
    pub async fn leave(&self) -> Result<()> {
        let ltime = self.member_clock.increment();
        let now = Instant::now();
        self.manager
            .execute(|acc| acc.authoritative_leave(&self.local_name, ltime, true, now))
            .await;

        let msg = SerfMessage::Leave(LeaveMessage {
            ltime,
            node: self.local_name.clone(),
            prune: false,
        });
        let encoded = msg.encode()?;
        self.queues.lock().await.membership.enqueue(encoded, None);
        self.snapshotter.leave().await;

        let local = Member::new(self.local_name.clone(), self.local_addr, self.local_port);
        let _ = self
            .internal_event_tx
            .send(SerfEvent::Member(MemberEvent { kind: MemberEventKind::Leave, members: vec![local] }))
            .await;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// §4.8: the transport just reported a second node claiming our own
    /// name. Ask the cluster which address it believes is the real `name`
    /// via a `_serf_conflict` query, and self-shutdown if the responses
    /// don't give the local address a strict majority. A query that times
    /// out with zero responses is treated as "survive" — in practice this
    /// only happens on a near-empty cluster, where the conflict is likely
    /// spurious and shutting down a node nobody else can confirm is wrong
    /// would be worse than staying up.
    async fn resolve_name_conflict(&self, conflicting: Member) {
        if !self.config.enable_name_conflict_resolution {
            return;
        }

        tracing::warn!(node = %self.local_name, other = %conflicting.addr, "member.name_conflict");

        let mut handle = match self
            .query(
                crate::query::internal::CONFLICT_QUERY,
                self.local_name.clone().into_bytes(),
                QueryParam::default(),
            )
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(error = %err, "member.name_conflict_query_failed");
                return;
            }
        };

        let mut total = 0u32;
        let mut local_votes = 0u32;
        while let Some((_from, payload)) = handle.responses.recv().await {
            let Ok(member) = bincode::deserialize::<Member>(&payload) else {
                continue;
            };
            total += 1;
            if (member.addr, member.port) == (self.local_addr, self.local_port) {
                local_votes += 1;
            }
        }

        if total == 0 {
            tracing::debug!(node = %self.local_name, "member.name_conflict_no_responses");
            return;
        }

        let required = total / 2 + 1;
        if local_votes >= required {
            tracing::info!(node = %self.local_name, local_votes, total, "member.name_conflict_survived");
        } else {
            tracing::warn!(node = %self.local_name, local_votes, total, "member.name_conflict_lost");
            self.shutdown();
        }
    }

    pub async fn members(&self) -> Vec<Member> {
        self.manager.execute(|acc| acc.list_all().into_iter().map(|i| i.member.clone()).collect()).await
    }

    /// Filters the local member view by name, status, and/or tag regexes
    /// (anchored, same rule the query engine's own tag filter uses).
    pub async fn members_filtered(
        &self,
        tags: &HashMap<String, String>,
        status: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<Member>> {
        let compiled: Vec<(String, Regex)> = tags
            .iter()
            .map(|(k, v)| crate::query::filter::anchored(v).map(|re| (k.clone(), re)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Decode(e.to_string()))?;

        let all = self.members().await;
        Ok(all
            .into_iter()
            .filter(|m| status.map(|s| m.status.as_str() == s).unwrap_or(true))
            .filter(|m| name.map(|n| m.name == n).unwrap_or(true))
            .filter(|m| compiled.iter().all(|(k, re)| m.tags.get(k).map(|v| re.is_match(v)).unwrap_or(false)))
            .collect())
    }

    pub async fn set_tags(&self, set_tags: HashMap<String, String>, delete_tags: Vec<String>) -> Result<()> {
        {
            let mut tags = self.local_tags.write().unwrap();
            for key in &delete_tags {
                tags.remove(key);
            }
            for (k, v) in set_tags {
                tags.insert(k, v);
            }
        }
        let updated = self.local_tags.read().unwrap().clone();

        let ltime = self.member_clock.increment();
        self.manager.execute(|acc| acc.update_tags(&self.local_name, updated.clone())).await;

        let msg = SerfMessage::Join(JoinMessage { ltime, node: self.local_name.clone() });
        let encoded = msg.encode()?;
        self.queues.lock().await.membership.enqueue(encoded, None);

        let local = Member::new(self.local_name.clone(), self.local_addr, self.local_port);
        let _ = self
            .internal_event_tx
            .send(SerfEvent::Member(MemberEvent { kind: MemberEventKind::Update, members: vec![local] }))
            .await;
        Ok(())
    }

    /// Operator-issued `force-leave`: marks a member Left (or removes it
    /// outright if `prune`) and gossips the departure so the rest of the
    /// cluster converges without waiting for the reaper.
    pub async fn remove_failed_node(&self, node: &str, prune: bool) -> Result<()> {
        let known = self.manager.execute(|acc| acc.get(node).is_some()).await;
        if !known {
            return Err(Error::UnknownMember(node.to_string()));
        }

        let ltime = self.member_clock.increment();
        if prune {
            self.manager.execute(|acc| acc.remove(node)).await;
        } else {
            self.manager.execute(|acc| acc.apply_intent_status(node, MemberStatus::Left, ltime, Instant::now())).await;
        }

        let msg = SerfMessage::Leave(LeaveMessage { ltime, node: node.to_string(), prune });
        let encoded = msg.encode()?;
        self.queues.lock().await.membership.enqueue(encoded, None);
        Ok(())
    }

    pub async fn user_event(&self, name: &str, payload: Vec<u8>, coalesce: bool) -> Result<()> {
        if payload.len() > self.config.user_event_size_limit {
            return Err(Error::UserEventTooLarge(payload.len(), self.config.user_event_size_limit));
        }

        let ltime = self.event_clock.increment();
        let clock_time = self.event_clock.time();
        self.event_buffer.lock().unwrap().observe(clock_time, ltime, name, &payload);

        let _ = self
            .internal_event_tx
            .send(SerfEvent::User(UserEvent { ltime, name: name.to_string(), payload: payload.clone(), coalesce }))
            .await;

        let msg = SerfMessage::UserEvent(UserEventMessage { ltime, name: name.to_string(), payload, coalesce });
        let encoded = msg.encode()?;
        self.queues.lock().await.event.enqueue(encoded, None);
        Ok(())
    }

    pub async fn query(&self, name: &str, payload: Vec<u8>, param: QueryParam) -> Result<QueryHandle> {
        let member_count = self.manager.execute(|acc| acc.count()).await;
        let timeout = param
            .timeout
            .unwrap_or_else(|| query::default_timeout(ms(self.config.gossip_interval_ms), self.config.query_timeout_mult as u32, member_count));

        let (msg, handle) = self.query_engine.start_query(
            self.local_addr,
            self.local_port,
            &self.local_name,
            name,
            payload,
            &param,
            self.config.query_size_limit,
            timeout,
        )?;

        let ltime = msg.ltime;
        let encoded = SerfMessage::Query(msg).encode()?;
        self.queues.lock().await.query.enqueue(encoded, None);

        let engine = self.query_engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.expire(ltime);
        });

        Ok(handle)
    }

    pub async fn get_coordinate(&self, node: &str) -> Result<Option<Coordinate>> {
        let Some(coordinate) = &self.coordinate else {
            return Ok(None);
        };
        if node == self.local_name {
            return Ok(Some(coordinate.lock().await.coordinate()));
        }
        Ok(self.prober.peer_coordinate(node).await)
    }

    pub fn install_key(&self, key: Vec<u8>) {
        self.keyring.write().unwrap().install(key);
    }

    pub fn use_key(&self, key: Vec<u8>) {
        self.keyring.write().unwrap().use_key(key);
    }

    pub fn remove_key(&self, key: &[u8]) -> Result<()> {
        self.keyring.write().unwrap().remove(key)
    }

    pub fn list_keys(&self) -> (Vec<u8>, Vec<Vec<u8>>) {
        let kr = self.keyring.read().unwrap();
        (kr.primary_key(), kr.keys())
    }

    pub async fn stats(&self) -> crate::rpc::commands::StatsResponse {
        let (members, failed, left) = self
            .manager
            .execute(|acc| (acc.count(), acc.failed_names().len(), acc.left_names().len()))
            .await;
        let intent_queue = self.manager.execute_intents(|buf| buf.len()).await;

        let (membership_queue_depth, query_queue_depth, event_queue_depth) = {
            let q = self.queues.lock().await;
            (q.membership.len(), q.query.len(), q.event.len())
        };

        let coordinate_resets = match &self.coordinate {
            Some(c) => c.lock().await.resets(),
            None => 0,
        };

        crate::rpc::commands::StatsResponse {
            members,
            failed,
            left,
            member_clock: self.member_clock.time().0,
            event_clock: self.event_clock.time().0,
            query_clock: self.query_engine.clock().time().0,
            intent_queue,
            event_queue_depth,
            query_queue_depth,
            membership_queue_depth,
            coordinate_resets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config(name: &str, port: u16) -> Config {
        let mut c = Config::default();
        c.node_name = name.to_string();
        c.bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        c.gossip_interval_ms = 50;
        c.reap_interval_ms = 50_000;
        c.queue_check_interval_ms = 50_000;
        c.reconnect_interval_ms = 50_000;
        c
    }

    #[tokio::test]
    async fn new_node_knows_only_itself() {
        let (serf, _rx) = Serf::new(test_config("solo", 17946)).await.unwrap();
        let members = serf.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "solo");
        serf.shutdown();
    }

    #[tokio::test]
    async fn join_with_no_addresses_is_rejected() {
        let (serf, _rx) = Serf::new(test_config("alone", 17947)).await.unwrap();
        let err = serf.join(&[]).await.unwrap_err();
        assert!(matches!(err, Error::EmptyJoinList));
        serf.shutdown();
    }

    #[tokio::test]
    async fn user_event_over_the_size_limit_is_rejected() {
        let mut cfg = test_config("limits", 17948);
        cfg.user_event_size_limit = 4;
        let (serf, _rx) = Serf::new(cfg).await.unwrap();
        let err = serf.user_event("big", vec![0u8; 16], false).await.unwrap_err();
        assert!(matches!(err, Error::UserEventTooLarge(16, 4)));
        serf.shutdown();
    }

    #[tokio::test]
    async fn set_tags_updates_local_member_and_emits_update() {
        let (serf, mut rx) = Serf::new(test_config("tagger", 17949)).await.unwrap();
        let mut set = HashMap::new();
        set.insert("role".to_string(), "web".to_string());
        serf.set_tags(set, vec![]).await.unwrap();

        let members = serf.members().await;
        assert_eq!(members[0].tags.get("role"), Some(&"web".to_string()));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        match event {
            SerfEvent::Member(m) => assert_eq!(m.kind, MemberEventKind::Update),
            _ => panic!("expected a member update event"),
        }
        serf.shutdown();
    }

    #[tokio::test]
    async fn remove_failed_node_rejects_unknown_member() {
        let (serf, _rx) = Serf::new(test_config("remover", 17950)).await.unwrap();
        let err = serf.remove_failed_node("ghost", false).await.unwrap_err();
        assert!(matches!(err, Error::UnknownMember(_)));
        serf.shutdown();
    }

    #[tokio::test]
    async fn get_coordinate_for_local_node_reports_origin() {
        let (serf, _rx) = Serf::new(test_config("coord", 17951)).await.unwrap();
        let coord = serf.get_coordinate("coord").await.unwrap();
        assert!(coord.is_some());
        serf.shutdown();
    }

    #[tokio::test]
    async fn coordinates_disabled_reports_none() {
        let mut cfg = test_config("nocoord", 17952);
        cfg.disable_coordinates = true;
        let (serf, _rx) = Serf::new(cfg).await.unwrap();
        assert!(serf.get_coordinate("nocoord").await.unwrap().is_none());
        serf.shutdown();
    }

    #[tokio::test]
    async fn stats_reflects_current_membership() {
        let (serf, _rx) = Serf::new(test_config("stats", 17953)).await.unwrap();
        let stats = serf.stats().await;
        assert_eq!(stats.members, 1);
        assert_eq!(stats.failed, 0);
        serf.shutdown();
    }

    #[tokio::test]
    async fn name_conflict_with_no_responses_survives() {
        let (serf, _rx) = Serf::new(test_config("lonely", 17960)).await.unwrap();
        let impostor = Member::new("lonely", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4242);
        serf.resolve_name_conflict(impostor).await;
        assert!(!serf.shutdown.is_cancelled(), "a response-free tally must not trigger shutdown");
        serf.shutdown();
    }

    #[tokio::test]
    async fn name_conflict_resolution_disabled_by_config_is_a_no_op() {
        let mut cfg = test_config("disabled_conflict", 17961);
        cfg.enable_name_conflict_resolution = false;
        let (serf, _rx) = Serf::new(cfg).await.unwrap();
        let impostor = Member::new("disabled_conflict", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4242);
        serf.resolve_name_conflict(impostor).await;
        assert!(!serf.shutdown.is_cancelled());
        serf.shutdown();
    }

    #[tokio::test]
    async fn keyring_round_trips_through_serf() {
        let (serf, _rx) = Serf::new(test_config("keys", 17954)).await.unwrap();
        serf.use_key(b"primary".to_vec());
        serf.install_key(b"secondary".to_vec());
        let (primary, keys) = serf.list_keys();
        assert_eq!(primary, b"primary".to_vec());
        assert_eq!(keys.len(), 2);
        serf.shutdown();
    }
}
