//! src/rpc/commands.rs
//!
//! Request/response payload shapes for the 20 RPC commands (§4.13). Each
//! command's body is decoded independently once the server has read the
//! `RequestHeader.command` string — there's no single top-level enum
//! covering every command, mirroring how the distilled spec's own IPC
//! table is organized by command name rather than by a tagged union.

use crate::coordinate::Coordinate;
use crate::domain::Member;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

pub const HANDSHAKE: &str = "handshake";
pub const AUTH: &str = "auth";
pub const MEMBERS: &str = "members";
pub const MEMBERS_FILTERED: &str = "members-filtered";
pub const JOIN: &str = "join";
pub const LEAVE: &str = "leave";
pub const FORCE_LEAVE: &str = "force-leave";
pub const TAGS: &str = "tags";
pub const EVENT: &str = "event";
pub const QUERY: &str = "query";
pub const RESPOND: &str = "respond";
pub const STREAM: &str = "stream";
pub const MONITOR: &str = "monitor";
pub const STOP: &str = "stop";
pub const GET_COORDINATE: &str = "get-coordinate";
pub const INSTALL_KEY: &str = "install-key";
pub const USE_KEY: &str = "use-key";
pub const REMOVE_KEY: &str = "remove-key";
pub const LIST_KEYS: &str = "list-keys";
pub const STATS: &str = "stats";

/// The inclusive range of IPC protocol versions this server accepts in a
/// `handshake` request (§4.13's `[MinVersion,MaxVersion]` gate). There is
/// only one protocol generation today, so both ends are the same value.
pub const MIN_IPC_VERSION: u32 = 1;
pub const MAX_IPC_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthRequest {
    pub auth_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<Member>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MembersFilteredRequest {
    pub tags: HashMap<String, String>,
    pub status: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub existing: Vec<SocketAddr>,
    pub replay: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub num_joined: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForceLeaveRequest {
    pub node: String,
    pub prune: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TagsRequest {
    pub set_tags: HashMap<String, String>,
    pub delete_tags: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRequest {
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub name: String,
    pub payload: Vec<u8>,
    pub filter_nodes: Vec<String>,
    pub filter_tags: HashMap<String, String>,
    pub request_ack: bool,
    pub relay_factor: u8,
    pub timeout_ms: u64,
}

/// One streamed record on an in-flight `query` command: either an ack, a
/// response, or the final "done" marker so the client knows to stop
/// waiting without needing a separate timeout of its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum QueryRecord {
    Ack { from: String },
    Response { from: String, payload: Vec<u8> },
    Done,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RespondRequest {
    pub query_id: u32,
    pub payload: Vec<u8>,
}

/// Carries a query's id alongside its name and payload inside a `stream`
/// subscription's `StreamRecord::payload` when the forwarded event is a
/// query, so a later `respond` request can be routed back to the right
/// `QueryEvent::respond` channel. Not part of the gossip wire protocol —
/// purely an RPC-layer convenience for correlating `respond` with `query`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamQueryPayload {
    pub query_id: u32,
    pub name: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamRequest {
    pub event_types: Vec<String>,
}

/// One record delivered on a `stream` subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamRecord {
    pub event: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorRequest {
    pub log_level: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorRecord {
    pub line: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopRequest {
    pub stop_seq: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetCoordinateRequest {
    pub node: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetCoordinateResponse {
    pub coord: Option<Coordinate>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallKeyRequest {
    pub key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UseKeyRequest {
    pub key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveKeyRequest {
    pub key: String,
}

/// Aggregated result of a keyring operation across the responding
/// members the internal `_serf_*` query reached, keyed by member name.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyResponse {
    pub num_nodes: u32,
    pub num_resp: u32,
    pub num_err: u32,
    pub messages: HashMap<String, String>,
    pub keys: HashMap<String, u32>,
    pub primary_keys: HashMap<String, u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub members: usize,
    pub failed: usize,
    pub left: usize,
    pub member_clock: u64,
    pub event_clock: u64,
    pub query_clock: u64,
    pub intent_queue: usize,
    pub event_queue_depth: usize,
    pub query_queue_depth: usize,
    pub membership_queue_depth: usize,
    pub coordinate_resets: u64,
}
