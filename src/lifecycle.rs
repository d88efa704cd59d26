// State transition engine
//
// Applies the SWIM arbitration rules to inbound Alive/Suspect/Dead
// declarations. All conflict resolution is by the per-peer incarnation
// counter; wall-clock time never breaks ties. Accepted declarations are
// re-queued for gossip and surfaced to subscribers after the transition
// commits.
//
// Rules enforced here:
// - Alive updates a peer only at a strictly greater incarnation; an equal
//   incarnation never clears suspicion of another node.
// - Suspect and Dead apply at an equal or greater incarnation, except that
//   declarations about the local node are refuted by bumping the local
//   incarnation past the declared one.
// - Dead is terminal until the entry is reaped from the table.

use crate::broadcast::BroadcastQueue;
use crate::event::EventBus;
use crate::message::{Message, PushPullState};
use crate::node::{Member, MemberStatus};
use crate::state::MemberTable;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The arbitration core. Clones share one underlying engine, so background
/// timers can hold their own handle.
#[derive(Clone)]
pub struct LifecycleEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    local_name: String,
    table: Arc<MemberTable>,
    events: Arc<EventBus>,
    broadcasts: Arc<BroadcastQueue>,
    probe_interval: Duration,
    suspicion_mult: u32,
    /// Set during a graceful leave so the local Dead declaration is not
    /// refuted
    leaving: AtomicBool,
}

impl LifecycleEngine {
    pub fn new(
        local_name: impl Into<String>,
        table: Arc<MemberTable>,
        events: Arc<EventBus>,
        broadcasts: Arc<BroadcastQueue>,
        probe_interval: Duration,
        suspicion_mult: u32,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                local_name: local_name.into(),
                table,
                events,
                broadcasts,
                probe_interval,
                suspicion_mult,
                leaving: AtomicBool::new(false),
            }),
        }
    }

    /// Apply an Alive declaration.
    pub fn mark_alive(&self, incarnation: u64, name: &str, addr: SocketAddr, meta: Vec<u8>) {
        let inner = &self.inner;
        let mut table = inner.table.write();

        if !table.members.contains_key(name) {
            let member = Member {
                name: name.to_string(),
                addr,
                meta: meta.clone(),
                incarnation,
                status: MemberStatus::Alive,
                state_change: Instant::now(),
            };
            table.insert(member.clone());
            drop(table);

            inner.broadcasts.queue(
                name,
                Message::Alive {
                    incarnation,
                    name: name.to_string(),
                    addr,
                    meta,
                },
            );
            inner.events.publish_join(&member);
            tracing::info!(member = name, incarnation, "member joined");
            return;
        }

        let Some(state) = table.members.get_mut(name) else {
            return;
        };

        // Stale or duplicate news about any node is ignored; only a
        // strictly greater incarnation carries new information.
        if incarnation <= state.incarnation {
            return;
        }

        if name == inner.local_name {
            let refutation = state.incarnation_refuting(incarnation);
            drop(table);
            self.refute(refutation);
            return;
        }

        if state.status == MemberStatus::Dead {
            tracing::debug!(member = name, "ignoring alive declaration for a dead member");
            return;
        }

        state.incarnation = incarnation;
        state.addr = addr;
        state.meta = meta.clone();
        state.state_change = Instant::now();
        let was_refuted = state.status != MemberStatus::Alive;
        state.status = MemberStatus::Alive;
        let snapshot = state.clone();
        drop(table);

        inner.broadcasts.queue(
            name,
            Message::Alive {
                incarnation,
                name: name.to_string(),
                addr,
                meta,
            },
        );
        if was_refuted {
            inner.events.publish_update(&snapshot);
            tracing::info!(member = name, incarnation, "member refuted suspicion");
        }
    }

    /// Apply a Suspect declaration. `from` names the peer that raised the
    /// suspicion.
    pub fn mark_suspect(&self, incarnation: u64, name: &str, from: &str) {
        let inner = &self.inner;
        let mut table = inner.table.write();
        let Some(state) = table.members.get_mut(name) else {
            tracing::debug!(member = name, "ignoring suspicion of an unknown member");
            return;
        };
        if incarnation < state.incarnation {
            return;
        }

        if name == inner.local_name {
            let refutation = state.incarnation_refuting(incarnation);
            drop(table);
            self.refute(refutation);
            return;
        }

        // A member already suspect (or dead) stays put; re-suspicion does
        // not reset the clock on the original suspicion window.
        if state.status != MemberStatus::Alive {
            return;
        }

        state.incarnation = incarnation;
        state.status = MemberStatus::Suspect;
        state.state_change = Instant::now();
        let armed_at = state.state_change;
        let member_count = table.members.len();
        drop(table);

        inner.broadcasts.queue(
            name,
            Message::Suspect {
                incarnation,
                name: name.to_string(),
                from: from.to_string(),
            },
        );
        tracing::info!(member = name, incarnation, from, "member is suspect");

        self.arm_suspicion_timer(name.to_string(), incarnation, armed_at, member_count);
    }

    /// Apply a Dead declaration. `from` names the peer that declared the
    /// failure.
    pub fn mark_dead(&self, incarnation: u64, name: &str, from: &str) {
        let inner = &self.inner;
        let mut table = inner.table.write();
        let Some(state) = table.members.get_mut(name) else {
            tracing::debug!(member = name, "ignoring death of an unknown member");
            return;
        };
        if incarnation < state.incarnation {
            return;
        }
        if state.status == MemberStatus::Dead {
            return;
        }

        if name == inner.local_name && !inner.leaving.load(Ordering::SeqCst) {
            let refutation = state.incarnation_refuting(incarnation);
            drop(table);
            self.refute(refutation);
            return;
        }

        state.incarnation = incarnation;
        state.status = MemberStatus::Dead;
        state.state_change = Instant::now();
        let snapshot = state.clone();
        drop(table);

        inner.broadcasts.queue(
            name,
            Message::Dead {
                incarnation,
                name: name.to_string(),
                from: from.to_string(),
            },
        );
        inner.events.publish_leave(&snapshot);
        tracing::info!(member = name, incarnation, from, "member is dead");
    }

    /// Merge a remote push/pull snapshot by synthesizing the matching
    /// declarations. Arbitration keeps newer local knowledge intact.
    pub fn merge_remote(&self, entries: Vec<PushPullState>) {
        for entry in entries {
            match entry.status {
                MemberStatus::Alive => self.mark_alive(entry.incarnation, &entry.name, entry.addr, entry.meta),
                MemberStatus::Suspect => self.mark_suspect(entry.incarnation, &entry.name, &self.inner.local_name),
                MemberStatus::Dead => self.mark_dead(entry.incarnation, &entry.name, &self.inner.local_name),
            }
        }
    }

    /// Begin a graceful leave: declare the local node dead at its current
    /// incarnation so peers remove it without a suspicion round.
    pub fn leave(&self) {
        self.inner.leaving.store(true, Ordering::SeqCst);
        let Some(local) = self.inner.table.lookup(&self.inner.local_name) else {
            return;
        };
        self.mark_dead(local.incarnation, &local.name, &local.name);
    }

    /// Incarnation of the local node
    pub fn local_incarnation(&self) -> u64 {
        self.inner
            .table
            .lookup(&self.inner.local_name)
            .map(|m| m.incarnation)
            .unwrap_or(0)
    }

    /// Queue the refutation broadcast produced by
    /// `Member::incarnation_refuting`.
    fn refute(&self, refutation: Message) {
        if let Message::Alive { incarnation, .. } = &refutation {
            tracing::warn!(
                incarnation,
                "refuting a conflicting declaration about the local node"
            );
        }
        self.inner.broadcasts.queue(&self.inner.local_name, refutation);
    }

    fn arm_suspicion_timer(&self, name: String, incarnation: u64, armed_at: Instant, member_count: usize) {
        let timeout = suspicion_timeout(self.inner.suspicion_mult, member_count, self.inner.probe_interval);
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let expired = {
                let table = engine.inner.table.read();
                table
                    .members
                    .get(&name)
                    .map(|m| {
                        m.status == MemberStatus::Suspect
                            && m.incarnation == incarnation
                            && m.state_change == armed_at
                    })
                    .unwrap_or(false)
            };
            if expired {
                tracing::warn!(member = %name, "suspicion timeout expired");
                engine.mark_dead(incarnation, &name, &engine.inner.local_name);
            }
        });
    }
}

impl Member {
    /// Bump this (local) member's incarnation past a conflicting
    /// declaration and produce the Alive refutation to broadcast.
    fn incarnation_refuting(&mut self, declared: u64) -> Message {
        self.incarnation = declared + 1;
        Message::Alive {
            incarnation: self.incarnation,
            name: self.name.clone(),
            addr: self.addr,
            meta: self.meta.clone(),
        }
    }
}

/// Suspicion window before an unrefuted suspect is declared dead, scaled
/// logarithmically with cluster size.
pub fn suspicion_timeout(suspicion_mult: u32, n: usize, probe_interval: Duration) -> Duration {
    let node_scale = (n.max(1) as f64).log10().max(1.0);
    probe_interval.mul_f64(suspicion_mult as f64 * node_scale)
}
