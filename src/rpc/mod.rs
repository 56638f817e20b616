//! src/rpc/mod.rs
//!
//! The control-plane server (§4.13): a length-prefixed bincode protocol over
//! plain TCP that a CLI or sidecar process speaks to drive a running node —
//! membership queries and mutation, user events, cluster queries, key
//! management, and two long-lived subscription commands (`stream`/`monitor`)
//! layered over the same per-connection request loop.
//!
//! Every request is two frames: a `RequestHeader` naming the command, then a
//! command-specific payload frame decoded only once the handler knows its
//! type. Most commands answer with exactly one response (`ResponseHeader`
//! then a payload frame); `query`, `stream`, and `monitor` keep pushing
//! unframed-by-header record frames under the same `seq` until the caller
//! sends `stop` or the subscription's source dries up.

pub mod codec;
pub mod commands;
pub mod log;

use crate::error::{Error, Result};
use crate::events::SerfEvent;
use crate::query::QueryParam;
use crate::rpc::codec::{decode, encode, read_frame, write_frame, RequestHeader, ResponseHeader};
use crate::rpc::commands as cmd;
use crate::rpc::commands::StreamQueryPayload;
use crate::rpc::log::LogLine;
use crate::serf::Serf;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Binds and serves the control-plane protocol. A `None` `bind_addr` in
/// `Config` means the RPC surface is disabled entirely; `Serf::new` still
/// runs, it's simply not reachable except through the library API directly.
pub struct RpcServer {
    bind_addr: SocketAddr,
    auth_key: Option<String>,
    events: broadcast::Sender<SerfEvent>,
    logs: broadcast::Sender<LogLine>,
}

impl RpcServer {
    pub fn new(
        bind_addr: SocketAddr,
        auth_key: Option<String>,
        events: broadcast::Sender<SerfEvent>,
        logs: broadcast::Sender<LogLine>,
    ) -> Self {
        Self { bind_addr, auth_key, events, logs }
    }

    pub async fn run(self, serf: Arc<Serf>, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "rpc.listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let serf = serf.clone();
                    let auth_key = self.auth_key.clone();
                    let events = self.events.clone();
                    let logs = self.logs.clone();
                    let conn_shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, serf, auth_key, events, logs, conn_shutdown).await {
                            tracing::debug!(peer = %peer, error = %e, "rpc.connection_closed");
                        }
                    });
                }
            }
        }

        tracing::info!("rpc.shutdown");
        Ok(())
    }
}

/// Pre-encoded frame bytes destined for this connection's socket, funneled
/// through one writer task so one-shot responses and background
/// subscription records never interleave mid-frame.
type FrameTx = mpsc::Sender<Vec<u8>>;

async fn handle_connection(
    stream: TcpStream,
    serf: Arc<Serf>,
    auth_key: Option<String>,
    events: broadcast::Sender<SerfEvent>,
    logs: broadcast::Sender<LogLine>,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(64);
    let writer_shutdown = shutdown.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                maybe = frame_rx.recv() => {
                    let Some(body) = maybe else { break };
                    if write_frame(&mut write_half, &body).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = write_half.shutdown().await;
    });

    let authenticated = StdMutex::new(auth_key.is_none());
    let ipc_version = StdMutex::new(0u32);
    let subscriptions: Arc<StdMutex<HashMap<u64, CancellationToken>>> = Arc::new(StdMutex::new(HashMap::new()));
    let pending_respond: Arc<StdMutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>> = Arc::new(StdMutex::new(HashMap::new()));

    let result = read_loop(
        &mut read_half,
        &frame_tx,
        &serf,
        &auth_key,
        &authenticated,
        &ipc_version,
        &subscriptions,
        &pending_respond,
        &events,
        &logs,
        &shutdown,
    )
    .await;

    for (_, token) in subscriptions.lock().unwrap().drain() {
        token.cancel();
    }
    drop(frame_tx);
    let _ = writer_task.await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    frame_tx: &FrameTx,
    serf: &Arc<Serf>,
    auth_key: &Option<String>,
    authenticated: &StdMutex<bool>,
    ipc_version: &StdMutex<u32>,
    subscriptions: &Arc<StdMutex<HashMap<u64, CancellationToken>>>,
    pending_respond: &Arc<StdMutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>>,
    events: &broadcast::Sender<SerfEvent>,
    logs: &broadcast::Sender<LogLine>,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let header_bytes = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read_frame(reader) => frame?,
        };
        let header: RequestHeader = decode(&header_bytes)?;
        let payload = read_frame(reader).await?;
        let seq = header.seq;

        if header.command != cmd::HANDSHAKE && *ipc_version.lock().unwrap() == 0 {
            send_error(frame_tx, seq, "Handshake required").await;
            continue;
        }

        if header.command != cmd::HANDSHAKE
            && header.command != cmd::AUTH
            && auth_key.is_some()
            && !*authenticated.lock().unwrap()
        {
            send_error(frame_tx, seq, "Authentication required").await;
            continue;
        }

        match header.command.as_str() {
            cmd::HANDSHAKE => {
                let req: cmd::HandshakeRequest = decode(&payload)?;
                if *ipc_version.lock().unwrap() != 0 {
                    send_error(frame_tx, seq, "Handshake already performed").await;
                } else if req.version < cmd::MIN_IPC_VERSION || req.version > cmd::MAX_IPC_VERSION {
                    send_error(frame_tx, seq, "Unsupported IPC version").await;
                } else {
                    *ipc_version.lock().unwrap() = req.version;
                    send_ok(frame_tx, seq, &()).await;
                }
            }
            cmd::AUTH => {
                let req: cmd::AuthRequest = decode(&payload)?;
                let ok = auth_key.as_deref().map(|k| k == req.auth_key).unwrap_or(true);
                if ok {
                    *authenticated.lock().unwrap() = true;
                    send_ok(frame_tx, seq, &()).await;
                } else {
                    send_error(frame_tx, seq, "Invalid authentication token").await;
                }
            }
            cmd::MEMBERS => {
                let members = serf.members().await;
                send_ok(frame_tx, seq, &cmd::MembersResponse { members }).await;
            }
            cmd::MEMBERS_FILTERED => {
                let req: cmd::MembersFilteredRequest = decode(&payload)?;
                match serf.members_filtered(&req.tags, req.status.as_deref(), req.name.as_deref()).await {
                    Ok(members) => send_ok(frame_tx, seq, &cmd::MembersResponse { members }).await,
                    Err(e) => send_error(frame_tx, seq, e.to_string()).await,
                }
            }
            cmd::JOIN => {
                let req: cmd::JoinRequest = decode(&payload)?;
                match serf.join(&req.existing).await {
                    Ok(n) => send_ok(frame_tx, seq, &cmd::JoinResponse { num_joined: n as u32 }).await,
                    Err(e) => send_error(frame_tx, seq, e.to_string()).await,
                }
            }
            cmd::LEAVE => match serf.leave().await {
                Ok(()) => send_ok(frame_tx, seq, &()).await,
                Err(e) => send_error(frame_tx, seq, e.to_string()).await,
            },
            cmd::FORCE_LEAVE => {
                let req: cmd::ForceLeaveRequest = decode(&payload)?;
                match serf.remove_failed_node(&req.node, req.prune).await {
                    Ok(()) => send_ok(frame_tx, seq, &()).await,
                    Err(e) => send_error(frame_tx, seq, e.to_string()).await,
                }
            }
            cmd::TAGS => {
                let req: cmd::TagsRequest = decode(&payload)?;
                match serf.set_tags(req.set_tags, req.delete_tags).await {
                    Ok(()) => send_ok(frame_tx, seq, &()).await,
                    Err(e) => send_error(frame_tx, seq, e.to_string()).await,
                }
            }
            cmd::EVENT => {
                let req: cmd::EventRequest = decode(&payload)?;
                match serf.user_event(&req.name, req.payload, req.coalesce).await {
                    Ok(()) => send_ok(frame_tx, seq, &()).await,
                    Err(e) => send_error(frame_tx, seq, e.to_string()).await,
                }
            }
            cmd::QUERY => {
                let req: cmd::QueryRequest = decode(&payload)?;
                let param = QueryParam {
                    filters: query_filters(&req),
                    request_ack: req.request_ack,
                    relay_factor: req.relay_factor,
                    timeout: if req.timeout_ms == 0 { None } else { Some(std::time::Duration::from_millis(req.timeout_ms)) },
                };
                match serf.query(&req.name, req.payload, param).await {
                    Ok(handle) => {
                        send_ok(frame_tx, seq, &()).await;
                        spawn_query_subscription(frame_tx.clone(), seq, handle, subscriptions.clone());
                    }
                    Err(e) => send_error(frame_tx, seq, e.to_string()).await,
                }
            }
            cmd::RESPOND => {
                let req: cmd::RespondRequest = decode(&payload)?;
                let sender = pending_respond.lock().unwrap().remove(&req.query_id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(req.payload);
                        send_ok(frame_tx, seq, &()).await;
                    }
                    None => send_error(frame_tx, seq, "No pending queries matching ID").await,
                }
            }
            cmd::STREAM => {
                let req: cmd::StreamRequest = decode(&payload)?;
                if subscriptions.lock().unwrap().contains_key(&seq) {
                    send_error(frame_tx, seq, "Stream with given sequence exists").await;
                } else {
                    send_ok(frame_tx, seq, &()).await;
                    spawn_stream_subscription(
                        frame_tx.clone(),
                        seq,
                        req.event_types,
                        events.subscribe(),
                        pending_respond.clone(),
                        subscriptions.clone(),
                    );
                }
            }
            cmd::MONITOR => {
                let req: cmd::MonitorRequest = decode(&payload)?;
                if subscriptions.lock().unwrap().contains_key(&seq) {
                    send_error(frame_tx, seq, "Monitor already exists").await;
                } else {
                    send_ok(frame_tx, seq, &()).await;
                    spawn_monitor_subscription(frame_tx.clone(), seq, req.log_level, logs.subscribe(), subscriptions.clone());
                }
            }
            cmd::STOP => {
                let req: cmd::StopRequest = decode(&payload)?;
                if let Some(token) = subscriptions.lock().unwrap().remove(&req.stop_seq) {
                    token.cancel();
                }
                send_ok(frame_tx, seq, &()).await;
            }
            cmd::GET_COORDINATE => {
                let req: cmd::GetCoordinateRequest = decode(&payload)?;
                match serf.get_coordinate(&req.node).await {
                    Ok(coord) => send_ok(frame_tx, seq, &cmd::GetCoordinateResponse { coord }).await,
                    Err(e) => send_error(frame_tx, seq, e.to_string()).await,
                }
            }
            cmd::INSTALL_KEY => {
                let req: cmd::InstallKeyRequest = decode(&payload)?;
                match STANDARD.decode(&req.key) {
                    Ok(key) => {
                        serf.install_key(key);
                        send_ok(frame_tx, seq, &key_response_ok(serf)).await;
                    }
                    Err(e) => send_error(frame_tx, seq, format!("invalid base64 key: {e}")).await,
                }
            }
            cmd::USE_KEY => {
                let req: cmd::UseKeyRequest = decode(&payload)?;
                match STANDARD.decode(&req.key) {
                    Ok(key) => {
                        serf.use_key(key);
                        send_ok(frame_tx, seq, &key_response_ok(serf)).await;
                    }
                    Err(e) => send_error(frame_tx, seq, format!("invalid base64 key: {e}")).await,
                }
            }
            cmd::REMOVE_KEY => {
                let req: cmd::RemoveKeyRequest = decode(&payload)?;
                match STANDARD.decode(&req.key) {
                    Ok(key) => match serf.remove_key(&key) {
                        Ok(()) => send_ok(frame_tx, seq, &key_response_ok(serf)).await,
                        Err(e) => {
                            let mut resp = key_response_ok(serf);
                            resp.num_err = 1;
                            resp.messages.insert(serf.local_name().to_string(), e.to_string());
                            send_ok(frame_tx, seq, &resp).await;
                        }
                    },
                    Err(e) => send_error(frame_tx, seq, format!("invalid base64 key: {e}")).await,
                }
            }
            cmd::LIST_KEYS => {
                send_ok(frame_tx, seq, &key_response_ok(serf)).await;
            }
            cmd::STATS => {
                let stats = serf.stats().await;
                send_ok(frame_tx, seq, &stats).await;
            }
            _other => {
                send_error(frame_tx, seq, "Unsupported command").await;
            }
        }
    }
}

fn query_filters(req: &cmd::QueryRequest) -> Vec<crate::wire::Filter> {
    let mut filters = Vec::new();
    if !req.filter_nodes.is_empty() {
        filters.push(crate::wire::Filter::Node(req.filter_nodes.clone()));
    }
    for (tag, pattern) in &req.filter_tags {
        filters.push(crate::wire::Filter::Tag { tag: tag.clone(), regex: pattern.clone() });
    }
    filters
}

/// Reports local-only keyring state; this crate's internal-query dispatch
/// (`query/internal.rs`) doesn't implement the cluster-wide install/use/
/// remove-key fan-out, only the read-only `_serf_list-keys` query, so an
/// `install-key`/`use-key`/`remove-key` command only ever reflects this node.
fn key_response_ok(serf: &Arc<Serf>) -> cmd::KeyResponse {
    let (primary, keys) = serf.list_keys();
    let mut resp = cmd::KeyResponse { num_nodes: 1, num_resp: 1, num_err: 0, ..Default::default() };
    for key in keys {
        resp.keys.insert(STANDARD.encode(key), 1);
    }
    if !primary.is_empty() {
        resp.primary_keys.insert(STANDARD.encode(primary), 1);
    }
    resp
}

async fn send_ok<T: Serialize>(frame_tx: &FrameTx, seq: u64, payload: &T) {
    let Ok(header) = encode(&ResponseHeader::ok(seq)) else { return };
    let _ = frame_tx.send(header).await;
    if let Ok(body) = encode(payload) {
        let _ = frame_tx.send(body).await;
    }
}

async fn send_error(frame_tx: &FrameTx, seq: u64, message: impl Into<String>) {
    if let Ok(header) = encode(&ResponseHeader::err(seq, message)) {
        let _ = frame_tx.send(header).await;
    }
    if let Ok(body) = encode(&()) {
        let _ = frame_tx.send(body).await;
    }
}

/// Streams `QueryRecord`s for one in-flight `query` command until both the
/// ack and response channels close (the engine's timeout task drops them) or
/// the client sends `stop` for this `seq`.
fn spawn_query_subscription(
    frame_tx: FrameTx,
    seq: u64,
    mut handle: crate::query::QueryHandle,
    subscriptions: Arc<StdMutex<HashMap<u64, CancellationToken>>>,
) {
    let token = CancellationToken::new();
    subscriptions.lock().unwrap().insert(seq, token.clone());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                ack = handle.acks.recv() => {
                    match ack {
                        Some(from) => {
                            if send_record(&frame_tx, &cmd::QueryRecord::Ack { from }).await.is_err() { break; }
                        }
                        None => break,
                    }
                }
                resp = handle.responses.recv() => {
                    match resp {
                        Some((from, payload)) => {
                            if send_record(&frame_tx, &cmd::QueryRecord::Response { from, payload }).await.is_err() { break; }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = send_record(&frame_tx, &cmd::QueryRecord::Done).await;
        subscriptions.lock().unwrap().remove(&seq);
    });
}

/// Streams `StreamRecord`s from the broadcast event channel, filtered by
/// `event_types` (empty means everything). A forwarded `QueryEvent`'s
/// `respond` sender is stashed in `pending_respond` keyed by its query id so
/// a later `respond` command can answer it.
fn spawn_stream_subscription(
    frame_tx: FrameTx,
    seq: u64,
    event_types: Vec<String>,
    mut rx: broadcast::Receiver<SerfEvent>,
    pending_respond: Arc<StdMutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>>,
    subscriptions: Arc<StdMutex<HashMap<u64, CancellationToken>>>,
) {
    let token = CancellationToken::new();
    subscriptions.lock().unwrap().insert(seq, token.clone());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = rx.recv() => {
                    let event = match event {
                        Ok(e) => e,
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "rpc.stream_lagged");
                            continue;
                        }
                    };
                    let Some(record) = stream_record(event, &event_types, &pending_respond) else { continue };
                    if send_record(&frame_tx, &record).await.is_err() {
                        break;
                    }
                }
            }
        }
        subscriptions.lock().unwrap().remove(&seq);
    });
}

fn stream_record(
    event: SerfEvent,
    event_types: &[String],
    pending_respond: &Arc<StdMutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>>,
) -> Option<cmd::StreamRecord> {
    let wants = |kind: &str| event_types.is_empty() || event_types.iter().any(|t| t == kind);
    match event {
        SerfEvent::Member(m) => {
            let kind = m.kind.as_str();
            if !wants(kind) {
                return None;
            }
            let payload = bincode::serialize(&m.members).unwrap_or_default();
            Some(cmd::StreamRecord { event: kind.to_string(), payload })
        }
        SerfEvent::User(u) => {
            if !wants("user") && !wants(&format!("user:{}", u.name)) {
                return None;
            }
            Some(cmd::StreamRecord { event: format!("user:{}", u.name), payload: u.payload })
        }
        SerfEvent::Query(q) => {
            if !wants("query") && !wants(&format!("query:{}", q.name)) {
                return None;
            }
            pending_respond.lock().unwrap().insert(q.id, q.respond.clone());
            let payload = bincode::serialize(&StreamQueryPayload { query_id: q.id, name: q.name.clone(), payload: q.payload }).unwrap_or_default();
            Some(cmd::StreamRecord { event: format!("query:{}", q.name), payload })
        }
    }
}

fn spawn_monitor_subscription(
    frame_tx: FrameTx,
    seq: u64,
    log_level: String,
    mut rx: broadcast::Receiver<LogLine>,
    subscriptions: Arc<StdMutex<HashMap<u64, CancellationToken>>>,
) {
    let threshold = log_level.parse::<tracing::Level>().unwrap_or(tracing::Level::TRACE);
    let token = CancellationToken::new();
    subscriptions.lock().unwrap().insert(seq, token.clone());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                line = rx.recv() => {
                    let line = match line {
                        Ok(l) => l,
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    };
                    if line.level > threshold {
                        continue;
                    }
                    if send_record(&frame_tx, &cmd::MonitorRecord { line: line.text }).await.is_err() {
                        break;
                    }
                }
            }
        }
        subscriptions.lock().unwrap().remove(&seq);
    });
}

async fn send_record<T: Serialize>(frame_tx: &FrameTx, record: &T) -> std::result::Result<(), ()> {
    let body = encode(record).map_err(|_| ())?;
    frame_tx.send(body).await.map_err(|_| ())
}
