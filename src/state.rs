// Node state table
//
// The authoritative directory of known peers. A name-keyed map holds the
// entries; a parallel order vector supports uniform random sampling and the
// round-robin probe walk. Both live behind one reader-writer lock, which
// serializes conflicting declarations about the same member.

use crate::node::{Member, MemberStatus};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

pub(crate) struct TableInner {
    pub(crate) members: HashMap<String, Member>,
    /// Sampling order; reshuffled whenever the probe walk wraps
    pub(crate) order: Vec<String>,
    pub(crate) probe_index: usize,
}

impl TableInner {
    /// Insert a new member or replace an existing entry, keeping the order
    /// vector in sync. Returns true if the member was previously unknown.
    pub(crate) fn insert(&mut self, member: Member) -> bool {
        let known = self.members.contains_key(&member.name);
        if !known {
            self.order.push(member.name.clone());
        }
        self.members.insert(member.name.clone(), member);
        !known
    }

    /// Remove dead entries whose grace period has elapsed, then reshuffle
    /// the sampling order.
    pub(crate) fn reset(&mut self, reap_interval: Duration) -> usize {
        let members = &self.members;
        let reapable: Vec<String> = self
            .order
            .iter()
            .filter(|name| {
                members
                    .get(*name)
                    .map(|m| m.status == MemberStatus::Dead && m.state_change.elapsed() >= reap_interval)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for name in &reapable {
            self.remove(name);
        }
        self.order.shuffle(&mut rand::rng());
        self.probe_index = 0;
        reapable.len()
    }

    fn remove(&mut self, name: &str) {
        if self.members.remove(name).is_some() {
            if let Some(pos) = self.order.iter().position(|n| n == name) {
                self.order.swap_remove(pos);
                if pos < self.probe_index {
                    self.probe_index -= 1;
                }
            }
        }
    }
}

/// Thread-safe storage and sampling of peer state
pub struct MemberTable {
    local: String,
    inner: RwLock<TableInner>,
}

impl MemberTable {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local: local_name.into(),
            inner: RwLock::new(TableInner {
                members: HashMap::new(),
                order: Vec::new(),
                probe_index: 0,
            }),
        }
    }

    /// Name of the local node
    pub fn local_name(&self) -> &str {
        &self.local
    }

    /// Insert or replace an entry
    pub fn upsert(&self, member: Member) -> bool {
        self.inner.write().insert(member)
    }

    /// Snapshot copy of a single entry
    pub fn lookup(&self, name: &str) -> Option<Member> {
        self.inner.read().members.get(name).cloned()
    }

    /// Consistent snapshot of every entry, including dead ones
    pub fn snapshot(&self) -> Vec<Member> {
        self.inner.read().members.values().cloned().collect()
    }

    /// Number of known members
    pub fn len(&self) -> usize {
        self.inner.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().members.is_empty()
    }

    /// Remove an entry outright
    pub fn forget(&self, name: &str) {
        self.inner.write().remove(name);
    }

    /// Up to `k` distinct alive members chosen uniformly at random,
    /// skipping any name in `exclude`.
    pub fn random_k(&self, k: usize, exclude: &[&str]) -> Vec<Member> {
        let inner = self.inner.read();
        let n = inner.order.len();
        if n == 0 || k == 0 {
            return Vec::new();
        }

        let mut rng = rand::rng();
        let mut picked: Vec<Member> = Vec::with_capacity(k);
        // Random probing with a bounded number of attempts keeps the
        // selection uniform over the alive subset without a full scan.
        for _ in 0..3 * n {
            if picked.len() == k {
                break;
            }
            let name = &inner.order[rng.random_range(0..n)];
            if exclude.contains(&name.as_str()) {
                continue;
            }
            if picked.iter().any(|m| &m.name == name) {
                continue;
            }
            let member = &inner.members[name];
            if member.status != MemberStatus::Alive {
                continue;
            }
            picked.push(member.clone());
        }
        picked
    }

    /// Advance the round-robin probe walk and return the next probe-eligible
    /// member. Skips the local node and dead entries; wrapping the walk reaps
    /// reap-eligible dead members and reshuffles the order.
    pub fn next_probe_target(&self, reap_interval: Duration) -> Option<Member> {
        let mut inner = self.inner.write();
        let mut checked = 0;
        loop {
            let n = inner.order.len();
            if n == 0 || checked >= n {
                return None;
            }
            if inner.probe_index >= n {
                let reaped = inner.reset(reap_interval);
                if reaped > 0 {
                    tracing::debug!(reaped, "reaped dead members");
                }
                checked += 1;
                continue;
            }
            let name = inner.order[inner.probe_index].clone();
            inner.probe_index += 1;
            let member = &inner.members[&name];
            if name == self.local || member.status == MemberStatus::Dead {
                checked += 1;
                continue;
            }
            return Some(member.clone());
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, TableInner> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, TableInner> {
        self.inner.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn member(name: &str, status: MemberStatus) -> Member {
        Member {
            name: name.to_string(),
            addr: "127.0.0.1:7946".parse().unwrap(),
            meta: Vec::new(),
            incarnation: 1,
            status,
            state_change: Instant::now(),
        }
    }

    fn assert_order_integrity(table: &MemberTable) {
        let inner = table.read();
        assert_eq!(inner.members.len(), inner.order.len());
        for name in &inner.order {
            assert!(inner.members.contains_key(name));
        }
    }

    #[test]
    fn upsert_and_lookup() {
        let table = MemberTable::new("local");
        assert!(table.upsert(member("node1", MemberStatus::Alive)));
        assert!(!table.upsert(member("node1", MemberStatus::Suspect)));

        let got = table.lookup("node1").unwrap();
        assert_eq!(got.status, MemberStatus::Suspect);
        assert_eq!(table.len(), 1);
        assert_order_integrity(&table);
    }

    #[test]
    fn forget_keeps_order_in_sync() {
        let table = MemberTable::new("local");
        for name in ["node1", "node2", "node3"] {
            table.upsert(member(name, MemberStatus::Alive));
        }
        table.forget("node2");

        assert_eq!(table.len(), 2);
        assert!(table.lookup("node2").is_none());
        assert_order_integrity(&table);
    }

    #[test]
    fn random_k_selects_only_alive_non_excluded() {
        let table = MemberTable::new("local");
        table.upsert(member("local", MemberStatus::Alive));
        table.upsert(member("node1", MemberStatus::Alive));
        table.upsert(member("node2", MemberStatus::Alive));
        table.upsert(member("node3", MemberStatus::Suspect));
        table.upsert(member("node4", MemberStatus::Dead));

        let mut found = false;
        for _ in 0..50 {
            let picked = table.random_k(3, &["local", "node1"]);
            // selection is probabilistic, but never yields an ineligible member
            for m in &picked {
                assert_eq!(m.name, "node2");
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn random_k_returns_distinct_members() {
        let table = MemberTable::new("local");
        for i in 0..10 {
            table.upsert(member(&format!("node{}", i), MemberStatus::Alive));
        }
        let picked = table.random_k(5, &[]);
        assert_eq!(picked.len(), 5);
        let mut names: Vec<_> = picked.iter().map(|m| m.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn probe_walk_skips_local_and_dead() {
        let table = MemberTable::new("local");
        table.upsert(member("local", MemberStatus::Alive));
        table.upsert(member("node1", MemberStatus::Alive));
        table.upsert(member("node2", MemberStatus::Dead));
        table.upsert(member("node3", MemberStatus::Suspect));

        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let target = table.next_probe_target(Duration::from_secs(3600)).unwrap();
            assert_ne!(target.name, "local");
            assert_ne!(target.name, "node2");
            seen.insert(target.name);
        }
        // both eligible members get probed across rounds
        assert!(seen.contains("node1"));
        assert!(seen.contains("node3"));
    }

    #[test]
    fn probe_walk_with_no_eligible_peers_is_none() {
        let table = MemberTable::new("local");
        table.upsert(member("local", MemberStatus::Alive));
        assert!(table.next_probe_target(Duration::from_secs(3600)).is_none());

        table.upsert(member("node1", MemberStatus::Dead));
        assert!(table.next_probe_target(Duration::from_secs(3600)).is_none());
    }

    #[test]
    fn reset_reaps_dead_after_grace_period() {
        let table = MemberTable::new("local");
        table.upsert(member("local", MemberStatus::Alive));
        table.upsert(member("node1", MemberStatus::Alive));
        table.upsert(member("node2", MemberStatus::Dead));

        // within the grace period the dead entry survives
        table.write().reset(Duration::from_secs(3600));
        assert!(table.lookup("node2").is_some());

        std::thread::sleep(Duration::from_millis(15));
        table.write().reset(Duration::from_millis(10));
        assert!(table.lookup("node2").is_none());
        assert_eq!(table.len(), 2);
        assert_order_integrity(&table);
    }

    #[test]
    fn reaped_member_can_rejoin() {
        let table = MemberTable::new("local");
        table.upsert(member("node1", MemberStatus::Dead));
        std::thread::sleep(Duration::from_millis(15));
        table.write().reset(Duration::from_millis(10));
        assert!(table.lookup("node1").is_none());

        assert!(table.upsert(member("node1", MemberStatus::Alive)));
        assert_eq!(table.lookup("node1").unwrap().status, MemberStatus::Alive);
    }
}
