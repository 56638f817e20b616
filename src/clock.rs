//! src/clock.rs
//!
//! A monotonic, totally-ordered logical clock used to order membership
//! intents, user events, and queries without relying on synchronized wall
//! clocks. `Serf` keeps three independent instances (member, event, query)
//! so that churn on one axis never perturbs the buffers on another.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single logical timestamp. Totally ordered, monotonic per node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LamportTime(pub u64);

impl LamportTime {
    pub const ZERO: LamportTime = LamportTime(0);

    pub fn successor(self) -> LamportTime {
        LamportTime(self.0.wrapping_add(1))
    }
}

impl fmt::Display for LamportTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LamportTime {
    fn from(v: u64) -> Self {
        LamportTime(v)
    }
}

/// An atomically-witnessed logical clock.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Reads the current time without advancing it.
    pub fn time(&self) -> LamportTime {
        LamportTime(self.value.load(Ordering::SeqCst))
    }

    /// Advances the clock and returns the new (post-increment) time. Used
    /// when this node originates a new intent/event/query.
    pub fn increment(&self) -> LamportTime {
        LamportTime(self.value.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Witnesses an observed time `v`: sets the clock to `max(current, v) + 1`
    /// if `v >= current`. Leaves the clock strictly greater than `v` and
    /// never moves it backwards.
    pub fn witness(&self, v: LamportTime) {
        loop {
            let current = self.value.load(Ordering::SeqCst);
            if v.0 < current {
                return;
            }
            // max(current, v) + 1, saturating rather than wrapping so a
            // corrupt remote clock can't roll us back to zero.
            let next = v.0.saturating_add(1).max(current);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_monotonically() {
        let clock = LamportClock::new();
        assert_eq!(clock.increment(), LamportTime(1));
        assert_eq!(clock.increment(), LamportTime(2));
        assert_eq!(clock.time(), LamportTime(2));
    }

    #[test]
    fn witness_advances_past_observed_value() {
        let clock = LamportClock::new();
        clock.witness(LamportTime(41));
        assert!(clock.time() > LamportTime(41));
        assert_eq!(clock.time(), LamportTime(42));
    }

    #[test]
    fn witness_never_moves_backwards() {
        let clock = LamportClock::new();
        clock.increment();
        clock.increment();
        clock.increment();
        let before = clock.time();
        clock.witness(LamportTime(0));
        assert_eq!(clock.time(), before);
    }

    #[test]
    fn witness_is_noop_when_behind() {
        let clock = LamportClock::new();
        for _ in 0..10 {
            clock.increment();
        }
        let before = clock.time();
        clock.witness(LamportTime(3));
        assert_eq!(clock.time(), before);
    }
}
