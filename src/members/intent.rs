//! src/members/intent.rs
//!
//! Holds join/leave intents that arrive for a name the registry does not
//! yet know about (the authoritative transport callback for that node
//! hasn't landed yet). Reconciled by Lamport time once the callback does
//! arrive; swept of anything older than `recent_intent_timeout`.

use crate::clock::LamportTime;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntentKind {
    Join,
    Leave,
}

#[derive(Clone, Copy, Debug)]
pub struct NodeIntent {
    pub kind: IntentKind,
    pub ltime: LamportTime,
    pub recorded_at: Instant,
}

#[derive(Debug, Default)]
pub struct IntentBuffer {
    intents: HashMap<String, NodeIntent>,
}

impl IntentBuffer {
    pub fn new() -> Self {
        Self {
            intents: HashMap::new(),
        }
    }

    /// Records an intent for a not-yet-known name, unless a more recent one
    /// (by Lamport time) is already buffered.
    pub fn record(&mut self, name: &str, kind: IntentKind, ltime: LamportTime) -> bool {
        if let Some(existing) = self.intents.get(name) {
            if existing.ltime >= ltime {
                return false;
            }
        }
        self.intents.insert(
            name.to_string(),
            NodeIntent {
                kind,
                ltime,
                recorded_at: Instant::now(),
            },
        );
        true
    }

    /// Removes and returns the buffered intent for `name`, if any. Called
    /// once the authoritative callback for that name lands, so the intent
    /// can be reconciled against the freshly-created member.
    pub fn take(&mut self, name: &str) -> Option<NodeIntent> {
        self.intents.remove(name)
    }

    pub fn peek(&self, name: &str) -> Option<&NodeIntent> {
        self.intents.get(name)
    }

    /// Drops intents older than `timeout`, called opportunistically on
    /// every registry mutation rather than on its own timer.
    pub fn reap(&mut self, timeout: Duration) {
        let now = Instant::now();
        self.intents
            .retain(|_, intent| now.duration_since(intent.recorded_at) < timeout);
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}
