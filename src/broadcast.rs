//! src/broadcast.rs
//!
//! The transmit-limited queues that sit between `Serf` and the gossip
//! transport's piggy-back hook. Three independent instances exist
//! (membership, queries, events); the delegate drains them in that priority
//! order on every `GetBroadcasts(overhead, limit)` call. Every enqueued
//! message is treated as distinct — the "unique" discipline from the
//! distilled spec means this queue never invalidates an older entry in
//! favor of a newer one; semantic dedup happens downstream in the event and
//! query buffers instead.
//!
//! Per §4.4, an item isn't dropped the moment it's first handed to the
//! transport: it is retained and re-offered on subsequent rounds until it
//! has been drained `retransmit_limit` times, so the epidemic has a chance
//! to actually cover the cluster before the item is forgotten.

use tokio::sync::oneshot;

/// An item waiting to be drained by the gossip transport. `notify` is fired
/// once the message has been retransmitted its full quota of times and is
/// about to be evicted, mirroring Serf's "notify on broadcast" completion
/// channels (the completion is "this item's dissemination is done," not
/// "it went out once").
pub struct BroadcastItem {
    pub payload: Vec<u8>,
    pub notify: Option<oneshot::Sender<()>>,
    transmits: usize,
}

impl std::fmt::Debug for BroadcastItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastItem")
            .field("len", &self.payload.len())
            .field("transmits", &self.transmits)
            .finish()
    }
}

/// The number of times a freshly-enqueued item should be retransmitted
/// before eviction: `RetransmitMult * ceil(log10(member_count + 1))`,
/// floored at 1 round so a lone or two-node cluster still gets at least
/// one chance to deliver. Mirrors `query::default_timeout`'s use of the
/// same `log10(n+1)` shape for the analogous "how many gossip rounds does
/// it take to cover the cluster" question.
pub fn retransmit_limit(retransmit_mult: usize, member_count: usize) -> usize {
    let rounds = ((member_count as f64 + 1.0).log10().ceil()).max(1.0);
    ((retransmit_mult as f64) * rounds).max(1.0) as usize
}

/// A simple FIFO queue with a soft depth limit. Not a priority queue within
/// itself — priority among membership/query/event traffic is expressed by
/// draining three separate instances in a fixed order, not by weighting
/// entries within one.
#[derive(Debug, Default)]
pub struct BroadcastQueue {
    items: std::collections::VecDeque<BroadcastItem>,
    max_depth: usize,
}

impl BroadcastQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            items: std::collections::VecDeque::new(),
            max_depth,
        }
    }

    /// Enqueues `payload`. Returns `false` (shedding the message) once the
    /// queue is at `max_depth`, per the distilled spec's backpressure rule.
    pub fn enqueue(&mut self, payload: Vec<u8>, notify: Option<oneshot::Sender<()>>) -> bool {
        if self.max_depth > 0 && self.items.len() >= self.max_depth {
            return false;
        }
        self.items.push_back(BroadcastItem { payload, notify, transmits: 0 });
        true
    }

    /// Drains as many queued messages as fit within `byte_limit`, each
    /// message's own length counted against the budget alongside
    /// `overhead` bytes of framing charged once up front. An item that
    /// still has retransmits left after this round is requeued at the back
    /// so other items get a turn before it is offered again; an item that
    /// has now been sent `retransmit_limit` times is evicted and its
    /// notification channel fired. Items that don't fit in this round's
    /// budget are left untouched at the front for next time.
    pub fn drain(&mut self, overhead: usize, byte_limit: usize, retransmit_limit: usize) -> Vec<Vec<u8>> {
        let retransmit_limit = retransmit_limit.max(1);
        let mut out = Vec::new();
        let mut used = overhead;
        let candidates = self.items.len();
        for _ in 0..candidates {
            match self.items.front() {
                Some(item) if used + item.payload.len() <= byte_limit => {}
                _ => break,
            }
            let mut item = self.items.pop_front().unwrap();
            used += item.payload.len();
            item.transmits += 1;
            out.push(item.payload.clone());
            if item.transmits >= retransmit_limit {
                if let Some(notify) = item.notify.take() {
                    let _ = notify.send(());
                }
            } else {
                self.items.push_back(item);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Owns the three independent transmit queues and exposes the fixed
/// membership -> query -> event drain order the delegate relies on.
#[derive(Debug)]
pub struct BroadcastQueues {
    pub membership: BroadcastQueue,
    pub query: BroadcastQueue,
    pub event: BroadcastQueue,
}

impl BroadcastQueues {
    pub fn new(max_depth: usize) -> Self {
        Self {
            membership: BroadcastQueue::new(max_depth),
            query: BroadcastQueue::new(max_depth),
            event: BroadcastQueue::new(max_depth),
        }
    }

    pub fn get_broadcasts(&mut self, overhead: usize, byte_limit: usize, retransmit_limit: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut remaining = byte_limit;

        let membership = self.membership.drain(overhead, remaining, retransmit_limit);
        remaining = remaining.saturating_sub(membership.iter().map(Vec::len).sum::<usize>());
        out.extend(membership);

        let query = self.query.drain(0, remaining, retransmit_limit);
        remaining = remaining.saturating_sub(query.iter().map(Vec::len).sum::<usize>());
        out.extend(query);

        let event = self.event.drain(0, remaining, retransmit_limit);
        out.extend(event);

        out
    }

    pub fn total_depth(&self) -> usize {
        self.membership.len() + self.query.len() + self.event.len()
    }
}
