//! src/events.rs
//!
//! The event manager: buffers recent user events for dedup, ships
//! `MemberEvent`/`UserEvent`/`QueryEvent` out to subscribers, and owns the
//! optional coalescer that sits between the raw event source and the
//! user-facing channel.

use crate::clock::LamportTime;
use crate::domain::Member;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberEventKind {
    Join,
    Leave,
    Failed,
    Update,
    Reap,
}

impl MemberEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberEventKind::Join => "member-join",
            MemberEventKind::Leave => "member-leave",
            MemberEventKind::Failed => "member-failed",
            MemberEventKind::Update => "member-update",
            MemberEventKind::Reap => "member-reap",
        }
    }

    /// Member events coalesce except Reap, which must be observed promptly
    /// by the reaper's callers (it is a terminal, one-shot notification).
    pub fn is_coalesceable(&self) -> bool {
        !matches!(self, MemberEventKind::Reap)
    }
}

#[derive(Clone, Debug)]
pub struct MemberEvent {
    pub kind: MemberEventKind,
    pub members: Vec<Member>,
}

#[derive(Clone, Debug)]
pub struct UserEvent {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

/// A cluster query delivered to the user channel. `respond` forwards a
/// response payload back to the query engine's unicast path; it is cheap to
/// clone and may be called zero or more times (callers typically call it
/// once).
#[derive(Clone, Debug)]
pub struct QueryEvent {
    pub id: u32,
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,
    pub respond: mpsc::UnboundedSender<Vec<u8>>,
}

impl QueryEvent {
    pub fn respond(&self, payload: Vec<u8>) {
        let _ = self.respond.send(payload);
    }
}

#[derive(Clone, Debug)]
pub enum SerfEvent {
    Member(MemberEvent),
    User(UserEvent),
    Query(QueryEvent),
}

/// Per-ltime dedup record for user events, as described in the distilled
/// spec's `UserEventCollection`.
#[derive(Clone, Debug, Default)]
struct EventRecord {
    events: Vec<(String, Vec<u8>)>,
}

/// Ring buffer of recent user events indexed by Lamport time, used both to
/// suppress duplicate delivery and to ship recent history during push/pull.
pub struct EventBuffer {
    min_time: LamportTime,
    capacity: u64,
    records: HashMap<LamportTime, EventRecord>,
}

impl EventBuffer {
    pub fn new(capacity: u64) -> Self {
        Self {
            min_time: LamportTime::ZERO,
            capacity: capacity.max(1),
            records: HashMap::new(),
        }
    }

    pub fn min_time(&self) -> LamportTime {
        self.min_time
    }

    pub fn set_min_time(&mut self, v: LamportTime) {
        if v > self.min_time {
            self.min_time = v;
        }
    }

    fn floor(&self, clock_time: LamportTime) -> LamportTime {
        LamportTime(clock_time.0.saturating_sub(self.capacity))
    }

    /// Returns `true` (accept, and rebroadcast) if `(ltime, name, payload)`
    /// is new information; `false` if it's too old or a duplicate.
    pub fn observe(&mut self, clock_time: LamportTime, ltime: LamportTime, name: &str, payload: &[u8]) -> bool {
        if ltime < self.min_time || ltime < self.floor(clock_time) {
            return false;
        }
        let record = self.records.entry(ltime).or_default();
        if record
            .events
            .iter()
            .any(|(n, p)| n == name && p.as_slice() == payload)
        {
            return false;
        }
        record.events.push((name.to_string(), payload.to_vec()));
        true
    }

    pub fn prune(&mut self, clock_time: LamportTime) {
        let floor = self.floor(clock_time);
        self.records.retain(|ltime, _| *ltime >= floor && *ltime >= self.min_time);
    }

    pub fn snapshot(&self) -> Vec<crate::wire::UserEventCollection> {
        self.records
            .iter()
            .map(|(ltime, record)| crate::wire::UserEventCollection {
                ltime: *ltime,
                events: record.events.clone(),
            })
            .collect()
    }
}

/// Per-ltime dedup of incoming query IDs.
pub struct QueryBuffer {
    min_time: LamportTime,
    capacity: u64,
    seen: HashMap<LamportTime, std::collections::HashSet<u32>>,
}

impl QueryBuffer {
    pub fn new(capacity: u64) -> Self {
        Self {
            min_time: LamportTime::ZERO,
            capacity: capacity.max(1),
            seen: HashMap::new(),
        }
    }

    pub fn min_time(&self) -> LamportTime {
        self.min_time
    }

    pub fn set_min_time(&mut self, v: LamportTime) {
        if v > self.min_time {
            self.min_time = v;
        }
    }

    fn floor(&self, clock_time: LamportTime) -> LamportTime {
        LamportTime(clock_time.0.saturating_sub(self.capacity))
    }

    /// Returns `true` if `id` at `ltime` is new (should be processed and
    /// potentially rebroadcast).
    pub fn observe(&mut self, clock_time: LamportTime, ltime: LamportTime, id: u32) -> bool {
        if ltime < self.min_time || ltime < self.floor(clock_time) {
            return false;
        }
        let set = self.seen.entry(ltime).or_default();
        set.insert(id)
    }

    pub fn prune(&mut self, clock_time: LamportTime) {
        let floor = self.floor(clock_time);
        self.seen.retain(|ltime, _| *ltime >= floor && *ltime >= self.min_time);
    }
}

/// Coalescing configuration for one event class (member events, or user
/// events — each may be configured independently).
#[derive(Clone, Copy, Debug, Default)]
pub struct CoalesceConfig {
    pub period: Duration,
    pub quiescent: Duration,
}

impl CoalesceConfig {
    pub fn enabled(&self) -> bool {
        !self.period.is_zero()
    }
}

/// Coalesces same-name member/user events over a quantum/quiescent window.
/// Per the distilled spec's resolved Open Question, when coalescing is
/// disabled no ingress task is spawned at all — callers get `None` back
/// from `spawn` and should wire events straight to the output channel.
pub struct Coalescer;

impl Coalescer {
    /// Spawns the coalescing task if `config` is enabled, returning the
    /// sender callers should push raw events into. Returns `None` if
    /// coalescing is disabled (period == 0).
    pub fn spawn(
        config: CoalesceConfig,
        output: mpsc::Sender<SerfEvent>,
        shutdown: CancellationToken,
    ) -> Option<mpsc::Sender<SerfEvent>> {
        if !config.enabled() {
            return None;
        }

        let (tx, mut rx) = mpsc::channel::<SerfEvent>(256);
        tokio::spawn(async move {
            // Keyed by a coalesce key (member name, or user event name);
            // latest event for that key wins.
            let mut batch: HashMap<String, SerfEvent> = HashMap::new();
            let mut batch_start: Option<Instant> = None;
            let mut last_event: Option<Instant> = None;

            loop {
                let deadline = match (batch_start, last_event) {
                    (Some(start), Some(last)) => {
                        let period_deadline = start + config.period;
                        let quiescent_deadline = last + config.quiescent;
                        Some(period_deadline.min(quiescent_deadline))
                    }
                    _ => None,
                };

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        break;
                    }
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                if !Self::coalesce_key(&event).is_some() {
                                    // Not coalesceable (e.g. MemberReap): pass through now.
                                    let _ = output.send(event).await;
                                    continue;
                                }
                                let key = Self::coalesce_key(&event).unwrap();
                                let now = Instant::now();
                                if batch.is_empty() {
                                    batch_start = Some(now);
                                }
                                last_event = Some(now);
                                batch.insert(key, event);
                            }
                            None => break,
                        }
                    }
                    _ = async { if let Some(d) = deadline { sleep_until(d).await } else { std::future::pending::<()>().await } }, if deadline.is_some() => {
                        for (_, event) in batch.drain() {
                            let _ = output.send(event).await;
                        }
                        batch_start = None;
                        last_event = None;
                    }
                }
            }
            for (_, event) in batch.drain() {
                let _ = output.send(event).await;
            }
        });

        Some(tx)
    }

    fn coalesce_key(event: &SerfEvent) -> Option<String> {
        match event {
            SerfEvent::Member(m) if m.kind.is_coalesceable() => {
                Some(format!("{}:{}", m.kind.as_str(), m.members.first().map(|x| x.name.as_str()).unwrap_or("")))
            }
            SerfEvent::Member(_) => None,
            SerfEvent::User(u) if u.coalesce => Some(format!("user:{}", u.name)),
            SerfEvent::User(_) => None,
            SerfEvent::Query(_) => None,
        }
    }
}
