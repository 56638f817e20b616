//! src/members/mod.rs
//!
//! The authoritative map of node name -> member record, plus the auxiliary
//! Failed/Left lists the reaper and reconnect loops iterate. All mutation
//! funnels through `MemberManager::execute`, the single synchronization
//! boundary for membership described in the distilled spec (§4.2): no other
//! component may reach into the maps outside of a transaction.

pub mod intent;
pub mod state;

use crate::clock::LamportTime;
use crate::domain::{Member, MemberInfo, MemberStatus};
use intent::IntentBuffer;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::RwLock;

/// What happened to a member as the result of a transition, so callers
/// (node-event and intent handlers) can decide which `MemberEvent` to emit
/// without re-deriving it from before/after snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Created,
    Updated,
    Resurrected,
    NoChange,
}

struct Registry {
    local_name: String,
    members: HashMap<String, MemberInfo>,
    failed: Vec<String>,
    left: Vec<String>,
}

impl Registry {
    fn remove_from_aux_lists(&mut self, name: &str) {
        self.failed.retain(|n| n != name);
        self.left.retain(|n| n != name);
    }

    fn push_aux_list(&mut self, name: &str, status: MemberStatus) {
        self.remove_from_aux_lists(name);
        match status {
            MemberStatus::Failed => self.failed.push(name.to_string()),
            MemberStatus::Left => self.left.push(name.to_string()),
            _ => {}
        }
    }
}

/// A transactional view over the registry, valid only for the lifetime of
/// one `MemberManager::execute` call. Every read and write in the crate
/// that touches membership goes through this type.
pub struct Accessor<'a> {
    registry: &'a mut Registry,
}

impl<'a> Accessor<'a> {
    pub fn get(&self, name: &str) -> Option<&MemberInfo> {
        self.registry.members.get(name)
    }

    pub fn local_name(&self) -> &str {
        &self.registry.local_name
    }

    pub fn list_all(&self) -> Vec<&MemberInfo> {
        self.registry.members.values().collect()
    }

    pub fn list_by_status(&self, status: MemberStatus) -> Vec<&MemberInfo> {
        self.registry
            .members
            .values()
            .filter(|info| info.member.status == status)
            .collect()
    }

    pub fn failed_names(&self) -> &[String] {
        &self.registry.failed
    }

    pub fn left_names(&self) -> &[String] {
        &self.registry.left
    }

    pub fn count(&self) -> usize {
        self.registry.members.len()
    }

    /// Inserts a brand-new member (status `Alive`). Used by the node-event
    /// handler when it sees a name for the first time.
    pub fn insert_alive(&mut self, member: Member, ltime: LamportTime) {
        let name = member.name.clone();
        self.registry.remove_from_aux_lists(&name);
        self.registry
            .members
            .insert(name, MemberInfo::new(member, ltime));
    }

    /// Authoritative join: inserts if unknown, or updates tags/addr and
    /// flips Left/Failed -> Alive if the member already existed. Only the
    /// node-event handler (never the intent handler) may call this, since
    /// resurrection requires transport authority.
    pub fn authoritative_join(&mut self, member: Member, ltime: LamportTime) -> Transition {
        let name = member.name.clone();
        match self.registry.members.get_mut(&name) {
            None => {
                self.registry.remove_from_aux_lists(&name);
                self.registry
                    .members
                    .insert(name, MemberInfo::new(member, ltime));
                Transition::Created
            }
            Some(info) => {
                let was_down = matches!(info.member.status, MemberStatus::Failed | MemberStatus::Left);
                info.member.addr = member.addr;
                info.member.port = member.port;
                info.member.tags = member.tags;
                info.member.protocol = member.protocol;
                info.status_ltime = ltime;
                if was_down {
                    info.member.status = MemberStatus::Alive;
                    self.registry.remove_from_aux_lists(&name);
                    Transition::Resurrected
                } else {
                    Transition::Updated
                }
            }
        }
    }

    /// Authoritative leave: `graceful` maps to `Left`, otherwise `Failed`.
    pub fn authoritative_leave(
        &mut self,
        name: &str,
        ltime: LamportTime,
        graceful: bool,
        now: Instant,
    ) -> Option<MemberStatus> {
        let info = self.registry.members.get_mut(name)?;
        let previous = info.member.status;
        info.member.status = if graceful {
            MemberStatus::Left
        } else {
            MemberStatus::Failed
        };
        info.status_ltime = ltime;
        info.leave_time = Some(now);
        self.registry.push_aux_list(name, info.member.status);
        Some(previous)
    }

    /// Intent-driven update: only applied if `ltime` strictly advances the
    /// member's `status_ltime`. Returns `true` if applied.
    pub fn apply_intent_status(
        &mut self,
        name: &str,
        new_status: MemberStatus,
        ltime: LamportTime,
        now: Instant,
    ) -> bool {
        let Some(info) = self.registry.members.get_mut(name) else {
            return false;
        };
        if ltime <= info.status_ltime {
            return false;
        }
        info.member.status = new_status;
        info.status_ltime = ltime;
        if matches!(new_status, MemberStatus::Left | MemberStatus::Failed) {
            info.leave_time = Some(now);
        }
        self.registry.push_aux_list(name, new_status);
        true
    }

    pub fn update_tags(&mut self, name: &str, tags: crate::tags::Tags) -> bool {
        let Some(info) = self.registry.members.get_mut(name) else {
            return false;
        };
        info.member.tags = tags;
        true
    }

    /// Removes a member outright (reaper expiry, or an operator `prune`).
    pub fn remove(&mut self, name: &str) -> Option<MemberInfo> {
        self.registry.remove_from_aux_lists(name);
        self.registry.members.remove(name)
    }
}

/// Owns the registry behind a reader/writer lock, and the latent-intent
/// buffer alongside it (intents concern names the registry doesn't have
/// yet, so they share the same transactional boundary).
pub struct MemberManager {
    registry: RwLock<Registry>,
    intents: RwLock<IntentBuffer>,
}

impl MemberManager {
    pub fn new(local: Member) -> Self {
        let mut members = HashMap::new();
        let local_name = local.name.clone();
        members.insert(local_name.clone(), MemberInfo::new(local, LamportTime::ZERO));
        Self {
            registry: RwLock::new(Registry {
                local_name,
                members,
                failed: Vec::new(),
                left: Vec::new(),
            }),
            intents: RwLock::new(IntentBuffer::new()),
        }
    }

    /// The single synchronization boundary for membership: runs `f` with
    /// exclusive access to the registry. `f` is a synchronous closure —
    /// nothing awaits while the lock is held, per the distilled spec's
    /// concurrency rules.
    pub async fn execute<R>(&self, f: impl FnOnce(&mut Accessor) -> R) -> R {
        let mut guard = self.registry.write().await;
        let mut accessor = Accessor {
            registry: &mut guard,
        };
        f(&mut accessor)
    }

    pub async fn execute_intents<R>(&self, f: impl FnOnce(&mut IntentBuffer) -> R) -> R {
        let mut guard = self.intents.write().await;
        f(&mut guard)
    }

    pub async fn count(&self) -> usize {
        self.registry.read().await.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn member(name: &str) -> Member {
        Member::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), 7946)
    }

    #[tokio::test]
    async fn authoritative_join_creates_unknown_member() {
        let mgr = MemberManager::new(member("local"));
        let transition = mgr
            .execute(|acc| acc.authoritative_join(member("a"), LamportTime(1)))
            .await;
        assert_eq!(transition, Transition::Created);
        assert_eq!(mgr.count().await, 2);
    }

    #[tokio::test]
    async fn authoritative_join_resurrects_a_failed_member() {
        let mgr = MemberManager::new(member("local"));
        mgr.execute(|acc| acc.authoritative_join(member("a"), LamportTime(1)))
            .await;
        mgr.execute(|acc| {
            acc.authoritative_leave("a", LamportTime(2), false, Instant::now())
        })
        .await;
        let transition = mgr
            .execute(|acc| acc.authoritative_join(member("a"), LamportTime(3)))
            .await;
        assert_eq!(transition, Transition::Resurrected);
        let status = mgr.execute(|acc| acc.get("a").unwrap().member.status).await;
        assert_eq!(status, MemberStatus::Alive);
    }

    #[tokio::test]
    async fn intent_with_stale_ltime_is_rejected() {
        let mgr = MemberManager::new(member("local"));
        mgr.execute(|acc| acc.authoritative_join(member("a"), LamportTime(5)))
            .await;
        let applied = mgr
            .execute(|acc| {
                acc.apply_intent_status("a", MemberStatus::Left, LamportTime(1), Instant::now())
            })
            .await;
        assert!(!applied);
    }

    #[tokio::test]
    async fn failed_and_left_lists_stay_consistent_with_status() {
        let mgr = MemberManager::new(member("local"));
        mgr.execute(|acc| acc.authoritative_join(member("a"), LamportTime(1)))
            .await;
        mgr.execute(|acc| acc.authoritative_leave("a", LamportTime(2), true, Instant::now()))
            .await;
        mgr.execute(|acc| {
            assert_eq!(acc.left_names(), &["a".to_string()]);
            assert!(acc.failed_names().is_empty());
        })
        .await;
    }
}
