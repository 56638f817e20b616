//! src/domain.rs
//!
//! The core, shared data structures passed between every other module:
//! the `Member` record, its finite-state-machine status, and the protocol
//! version bytes carried alongside it. Centralizing them here avoids
//! circular dependencies between the registry, the intent handlers, and the
//! RPC layer, which all need the same vocabulary.

use crate::clock::LamportTime;
use crate::tags::Tags;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;

/// A member's position in the per-name finite-state machine. Transitions are
/// driven by authoritative transport callbacks (which may resurrect a
/// Failed/Left member back to Alive) and by gossiped intents (which may only
/// advance a member forward by Lamport time).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    None,
    Alive,
    Leaving,
    Left,
    Failed,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::None => "none",
            MemberStatus::Alive => "alive",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Left => "left",
            MemberStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The six protocol-version bytes every member advertises: min/max/current
/// for the underlying gossip (memberlist-equivalent) protocol, and min/max/
/// current for this delegate layer's own wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersions {
    pub memberlist_protocol_min: u8,
    pub memberlist_protocol_max: u8,
    pub memberlist_protocol_cur: u8,
    pub delegate_protocol_min: u8,
    pub delegate_protocol_max: u8,
    pub delegate_protocol_cur: u8,
}

impl Default for ProtocolVersions {
    fn default() -> Self {
        Self {
            memberlist_protocol_min: 1,
            memberlist_protocol_max: 5,
            memberlist_protocol_cur: 5,
            delegate_protocol_min: 1,
            delegate_protocol_max: crate::tags::TAGS_PROTOCOL_MIN,
            delegate_protocol_cur: crate::tags::TAGS_PROTOCOL_MIN,
        }
    }
}

/// A cluster member as known to the registry: name, address, tags, and
/// current status. This is the shape exposed to API callers and shipped
/// over the RPC wire (`ipcMember` in the distilled spec's RPC table).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tags: Tags,
    pub status: MemberStatus,
    pub protocol: ProtocolVersions,
}

impl Member {
    pub fn new(name: impl Into<String>, addr: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            addr,
            port,
            tags: Tags::new(),
            status: MemberStatus::None,
            protocol: ProtocolVersions::default(),
        }
    }
}

/// Internal registry record: a `Member` plus the bookkeeping needed by the
/// reaper, the reconnector, and intent-monotonicity checks. `leave_time` is
/// a wall-clock `Instant`, never gossiped, used only to decide when a
/// Failed/Left member has aged out.
#[derive(Clone, Debug)]
pub struct MemberInfo {
    pub member: Member,
    pub status_ltime: LamportTime,
    pub leave_time: Option<Instant>,
}

impl MemberInfo {
    pub fn new(member: Member, status_ltime: LamportTime) -> Self {
        Self {
            member,
            status_ltime,
            leave_time: None,
        }
    }
}
