//! src/query/mod.rs
//!
//! The query request/response engine (§4.6): originates queries, tracks
//! outstanding ones so late acks/responses can be routed back to the
//! caller, and processes inbound `QueryMessage`/`QueryResponseMessage`
//! wire traffic with the same Lamport-time dedup discipline the event
//! buffer uses.

pub mod filter;
pub mod internal;

use crate::clock::{LamportClock, LamportTime};
use crate::error::{Error, Result};
use crate::events::QueryBuffer;
use crate::tags::Tags;
use crate::wire::{Filter, QueryFlags, QueryMessage};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Parameters controlling how a locally-originated query is broadcast and
/// how long the caller will wait for responses.
#[derive(Clone, Debug, Default)]
pub struct QueryParam {
    pub filters: Vec<Filter>,
    pub request_ack: bool,
    pub relay_factor: u8,
    pub timeout: Option<Duration>,
}

/// Computes the default query timeout per the distilled spec's formula:
/// `GossipInterval * QueryTimeoutMult * ceil(log10(n+1))`.
pub fn default_timeout(gossip_interval: Duration, timeout_mult: u32, member_count: usize) -> Duration {
    let n = (member_count as f64 + 1.0).log10().ceil().max(1.0);
    gossip_interval * timeout_mult * (n as u32)
}

/// Handed back to the caller that originated a query. Dropping it (or
/// letting the timeout elapse) simply stops new items from being
/// delivered; outstanding bookkeeping is cleaned up by the timeout task.
pub struct QueryHandle {
    pub ltime: LamportTime,
    pub id: u32,
    pub acks: mpsc::UnboundedReceiver<String>,
    pub responses: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
}

struct Outstanding {
    id: u32,
    acks: mpsc::UnboundedSender<String>,
    responses: mpsc::UnboundedSender<(String, Vec<u8>)>,
    acked_from: HashSet<String>,
    responded_from: HashSet<String>,
}

/// Owns the query Lamport clock, the inbound dedup buffer, and the table
/// of locally-originated queries still awaiting responses.
pub struct QueryEngine {
    clock: LamportClock,
    buffer: Mutex<QueryBuffer>,
    outstanding: Mutex<std::collections::HashMap<LamportTime, Outstanding>>,
}

impl QueryEngine {
    pub fn new(buffer_capacity: u64) -> Self {
        Self {
            clock: LamportClock::new(),
            buffer: Mutex::new(QueryBuffer::new(buffer_capacity)),
            outstanding: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// Builds the wire message for a new query and registers it so inbound
    /// acks/responses can find their way back to the returned handle.
    /// `size_limit` enforces the distilled spec's query payload cap.
    pub fn start_query(
        &self,
        local_addr: std::net::IpAddr,
        local_port: u16,
        source_node: &str,
        name: &str,
        payload: Vec<u8>,
        param: &QueryParam,
        size_limit: usize,
        timeout: Duration,
    ) -> Result<(QueryMessage, QueryHandle)> {
        if payload.len() > size_limit {
            return Err(Error::QueryTooLarge(payload.len(), size_limit));
        }

        let ltime = self.clock.increment();
        let id: u32 = rand::thread_rng().gen();

        let mut flags = QueryFlags::default();
        if param.request_ack {
            flags = flags | QueryFlags::ACK;
        }

        let filters = param
            .filters
            .iter()
            .map(|f| f.encode())
            .collect::<Result<Vec<_>>>()?;

        let msg = QueryMessage {
            ltime,
            id,
            addr: local_addr,
            port: local_port,
            source_node: source_node.to_string(),
            filters,
            flags,
            relay_factor: param.relay_factor,
            timeout_ms: timeout.as_millis() as u64,
            name: name.to_string(),
            payload,
        };

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        self.outstanding.lock().unwrap().insert(
            ltime,
            Outstanding {
                id,
                acks: ack_tx,
                responses: resp_tx,
                acked_from: HashSet::new(),
                responded_from: HashSet::new(),
            },
        );

        Ok((
            msg,
            QueryHandle {
                ltime,
                id,
                acks: ack_rx,
                responses: resp_rx,
            },
        ))
    }

    /// Removes the outstanding-query entry for `ltime`, dropping its
    /// channels so the caller's receivers observe end-of-stream. Callers
    /// that own an `Arc<QueryEngine>` spawn a timer that invokes this once
    /// the query's timeout elapses (see `Serf::query` in serf.rs).
    pub fn expire(&self, ltime: LamportTime) {
        self.outstanding.lock().unwrap().remove(&ltime);
    }

    /// Processes an inbound query: witnesses the clock, applies dedup, and
    /// (if the local node is a filter match) returns the pieces the caller
    /// needs to unicast an ack and/or hand the query to the user. Returns
    /// `None` if the query is a duplicate or too old — callers should drop
    /// it without rebroadcasting.
    pub fn handle_query(
        &self,
        msg: &QueryMessage,
        local_name: &str,
        local_tags: &Tags,
    ) -> Option<QueryDisposition> {
        self.clock.witness(msg.ltime);
        let clock_time = self.clock.time();
        let fresh = self.buffer.lock().unwrap().observe(clock_time, msg.ltime, msg.id);
        if !fresh {
            return None;
        }

        let filters: Vec<Filter> = msg
            .filters
            .iter()
            .filter_map(|raw| Filter::decode(raw).ok())
            .collect();
        let matched = filter::matches_local(&filters, local_name, local_tags);

        let flags = msg.flags;
        Some(QueryDisposition {
            matched,
            should_ack: matched && flags.contains(QueryFlags::ACK),
            rebroadcast: !flags.contains(QueryFlags::NO_BROADCAST),
            is_internal: msg.name.starts_with(INTERNAL_QUERY_PREFIX),
        })
    }

    /// Routes an inbound response (or bare ack) back to the matching
    /// outstanding query, deduplicating by sender name.
    pub fn handle_query_response(&self, msg: &crate::wire::QueryResponseMessage) {
        let mut table = self.outstanding.lock().unwrap();
        let Some(entry) = table.get_mut(&msg.ltime) else {
            return;
        };
        if entry.id != msg.id {
            return;
        }
        if msg.flags.contains(QueryFlags::ACK) {
            if entry.acked_from.insert(msg.from.clone()) {
                let _ = entry.acks.send(msg.from.clone());
            }
        } else if entry.responded_from.insert(msg.from.clone()) {
            let _ = entry.responses.send((msg.from.clone(), msg.payload.clone()));
        }
    }
}

pub const INTERNAL_QUERY_PREFIX: &str = "_serf_";

/// What a caller should do with a freshly-received `QueryMessage`.
#[derive(Clone, Copy, Debug)]
pub struct QueryDisposition {
    pub matched: bool,
    pub should_ack: bool,
    pub rebroadcast: bool,
    pub is_internal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn local() -> (IpAddr, u16) {
        (IpAddr::V4(Ipv4Addr::LOCALHOST), 7946)
    }

    #[test]
    fn start_query_rejects_oversized_payload() {
        let engine = QueryEngine::new(64);
        let (addr, port) = local();
        let err = engine
            .start_query(
                addr,
                port,
                "local",
                "big",
                vec![0u8; 100],
                &QueryParam::default(),
                10,
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(err, Error::QueryTooLarge(100, 10)));
    }

    #[test]
    fn handle_query_matches_node_filter() {
        let engine = QueryEngine::new(64);
        let (addr, port) = local();
        let (msg, _handle) = engine
            .start_query(
                addr,
                port,
                "origin",
                "ping",
                vec![],
                &QueryParam {
                    filters: vec![Filter::Node(vec!["target".into()])],
                    ..Default::default()
                },
                1024,
                Duration::from_secs(1),
            )
            .unwrap();

        let disposition = engine.handle_query(&msg, "target", &Tags::new()).unwrap();
        assert!(disposition.matched);
        assert!(disposition.rebroadcast);
    }

    #[test]
    fn handle_query_drops_duplicates() {
        let engine = QueryEngine::new(64);
        let (addr, port) = local();
        let (msg, _handle) = engine
            .start_query(
                addr,
                port,
                "origin",
                "ping",
                vec![],
                &QueryParam::default(),
                1024,
                Duration::from_secs(1),
            )
            .unwrap();

        assert!(engine.handle_query(&msg, "n", &Tags::new()).is_some());
        assert!(engine.handle_query(&msg, "n", &Tags::new()).is_none());
    }

    #[test]
    fn query_response_routes_to_the_right_channel() {
        let engine = QueryEngine::new(64);
        let (addr, port) = local();
        let (msg, mut handle) = engine
            .start_query(
                addr,
                port,
                "origin",
                "ping",
                vec![],
                &QueryParam::default(),
                1024,
                Duration::from_secs(1),
            )
            .unwrap();

        engine.handle_query_response(&crate::wire::QueryResponseMessage {
            ltime: msg.ltime,
            id: msg.id,
            from: "peer".into(),
            flags: QueryFlags::default(),
            payload: b"pong".to_vec(),
        });

        let (from, payload) = handle.responses.try_recv().unwrap();
        assert_eq!(from, "peer");
        assert_eq!(payload, b"pong");
    }

    #[test]
    fn internal_query_name_is_flagged() {
        let engine = QueryEngine::new(64);
        let (addr, port) = local();
        let (msg, _handle) = engine
            .start_query(
                addr,
                port,
                "origin",
                "_serf_ping",
                vec![],
                &QueryParam::default(),
                1024,
                Duration::from_secs(1),
            )
            .unwrap();
        let disposition = engine.handle_query(&msg, "n", &Tags::new()).unwrap();
        assert!(disposition.is_internal);
    }
}
