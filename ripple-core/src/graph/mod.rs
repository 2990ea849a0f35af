//! Dependency Graph
//!
//! This module implements the observer graph that connects reactive state to
//! the effects reading it, plus the job queue that defers effect re-runs.
//!
//! # Overview
//!
//! The graph is bipartite:
//!
//! - Deps are subscriber sets, one per state location (a container key) or per
//!   computed value.
//! - Effect nodes are the subscribers. Each one keeps the list of deps it is
//!   registered in.
//!
//! Effects and deps reference each other, so both live in slot-map arenas and
//! refer to each other by key. Removing a record never leaves a dangling
//! owner; a stale key simply fails to resolve.
//!
//! # Design Decisions
//!
//! 1. Effects re-track positionally. Every run bumps the effect's generation
//!    and rewinds a cursor over its dep list; tracking a dep writes it at the
//!    cursor. Whatever the cursor did not reach by the end of the run belongs
//!    to branches that were not taken and is unsubscribed.
//!
//! 2. A dep records the generation that tracked each subscriber. A trigger
//!    only affects subscribers whose recorded generation is current, so deps
//!    left over from a previous run of a running effect are ignored.
//!
//! 3. Empty deps are removed immediately, which keeps the map bounded by the
//!    live subscriptions.

mod key;
mod node;
mod scheduler;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use slotmap::SlotMap;
use smallvec::SmallVec;

pub use key::{ContainerId, Key, TargetKind, TrackOp, TriggerOp};
pub use node::{DepId, DirtyLevel, EffectId, NodeKind};
pub use scheduler::Job;

pub(crate) use node::{ComputedSource, Dep, DepOwner, EffectFn, EffectNode, StopHook};
pub(crate) use scheduler::JobQueue;

use key::affected_keys;

/// Outcome of asking whether an effect is dirty.
pub(crate) enum DirtyQuery {
    /// The answer is known without running user code.
    Resolved(bool),
    /// Computed deps must be refreshed, in this order, to find out.
    Refresh(Vec<Arc<dyn ComputedSource>>),
}

/// The dependency arena of one runtime.
pub(crate) struct Graph {
    pub(crate) effects: SlotMap<EffectId, EffectNode>,
    pub(crate) deps: SlotMap<DepId, Dep>,

    /// Deps of container locations, by container then key.
    targets: HashMap<ContainerId, HashMap<Key, DepId>>,

    /// Depth of nested batches. Schedulers are only invoked at depth zero.
    pub(crate) schedule_depth: usize,

    /// Effects whose scheduler must be invoked once the graph is unlocked.
    pub(crate) pending: VecDeque<EffectId>,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self {
            effects: SlotMap::with_key(),
            deps: SlotMap::with_key(),
            targets: HashMap::new(),
            schedule_depth: 0,
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn insert_effect(&mut self, node: EffectNode) -> EffectId {
        self.effects.insert(node)
    }

    /// Unsubscribe an effect from every dep and remove it from the arena.
    ///
    /// The node is handed back so that its closures are dropped by the caller
    /// after the graph is unlocked.
    pub(crate) fn remove_effect(&mut self, effect: EffectId) -> Option<EffectNode> {
        let node = self.effects.get_mut(effect)?;
        node.track_id += 1;
        node.deps_len = 0;

        self.post_cleanup(effect);
        self.pending.retain(|pending| *pending != effect);
        self.effects.remove(effect)
    }

    /// The dep of a container location, created on demand.
    pub(crate) fn target_dep(&mut self, target: ContainerId, key: Key) -> DepId {
        if let Some(dep) = self.targets.get(&target).and_then(|keys| keys.get(&key)) {
            return *dep;
        }

        let dep = self.deps.insert(Dep::new(DepOwner::Target { target, key }));
        self.targets.entry(target).or_default().insert(key, dep);
        dep
    }

    /// The dep of a computed value, created on demand.
    pub(crate) fn computed_dep(
        &mut self,
        node: EffectId,
        source: Weak<dyn ComputedSource>,
    ) -> Option<DepId> {
        let existing = self.effects.get(node)?.own_dep;
        if let Some(dep) = existing.filter(|dep| self.deps.contains_key(*dep)) {
            return Some(dep);
        }

        let dep = self.deps.insert(Dep::new(DepOwner::Computed { node, source }));
        if let Some(computed) = self.effects.get_mut(node) {
            computed.own_dep = Some(dep);
        }
        Some(dep)
    }

    /// Register `effect` as a subscriber of `dep` for its current run.
    ///
    /// Returns `false` when the effect already tracked the dep in this run.
    pub(crate) fn track_effect(&mut self, effect: EffectId, dep: DepId) -> bool {
        let Some(track_id) = self.effects.get(effect).map(|node| node.track_id) else {
            return false;
        };
        let Some(record) = self.deps.get_mut(dep) else {
            return false;
        };
        if record.subscribers.get(&effect) == Some(&track_id) {
            return false;
        }
        record.subscribers.insert(effect, track_id);

        let (cursor, previous) = match self.effects.get(effect) {
            Some(node) => (node.deps_len, node.deps.get(node.deps_len).copied()),
            None => return false,
        };

        if previous != Some(dep) {
            if let Some(previous) = previous {
                self.cleanup_dep_effect(previous, effect);
            }
            if let Some(node) = self.effects.get_mut(effect) {
                if cursor < node.deps.len() {
                    node.deps[cursor] = dep;
                } else {
                    node.deps.push(dep);
                }
            }
        }

        if let Some(node) = self.effects.get_mut(effect) {
            node.deps_len += 1;
        }
        true
    }

    /// Unsubscribe an effect from the deps its last run did not reach.
    pub(crate) fn post_cleanup(&mut self, effect: EffectId) {
        let stale: SmallVec<[DepId; 4]> = match self.effects.get(effect) {
            Some(node) if node.deps.len() > node.deps_len => {
                node.deps[node.deps_len..].iter().copied().collect()
            }
            _ => return,
        };

        for dep in stale {
            self.cleanup_dep_effect(dep, effect);
        }

        if let Some(node) = self.effects.get_mut(effect) {
            let len = node.deps_len;
            node.deps.truncate(len);
        }
    }

    /// Drop `effect` from `dep` unless it re-tracked the dep in its current run.
    fn cleanup_dep_effect(&mut self, dep: DepId, effect: EffectId) {
        let Some(track_id) = self.effects.get(effect).map(|node| node.track_id) else {
            return;
        };
        let Some(record) = self.deps.get_mut(dep) else {
            return;
        };

        match record.subscribers.get(&effect) {
            Some(tracked) if *tracked != track_id => {
                record.subscribers.shift_remove(&effect);
                if record.subscribers.is_empty() {
                    self.remove_dep(dep);
                }
            }
            _ => {}
        }
    }

    fn remove_dep(&mut self, dep: DepId) {
        let Some(record) = self.deps.remove(dep) else {
            return;
        };

        match record.owner {
            DepOwner::Target { target, key } => {
                if let Some(keys) = self.targets.get_mut(&target) {
                    if keys.get(&key) == Some(&dep) {
                        keys.remove(&key);
                    }
                    if keys.is_empty() {
                        self.targets.remove(&target);
                    }
                }
            }
            DepOwner::Computed { node, .. } => {
                if let Some(computed) = self.effects.get_mut(node) {
                    if computed.own_dep == Some(dep) {
                        computed.own_dep = None;
                    }
                }
            }
        }
    }

    /// Drop every dep of a container that no longer exists.
    pub(crate) fn forget_target(&mut self, target: ContainerId) {
        if let Some(keys) = self.targets.remove(&target) {
            for dep in keys.into_values() {
                self.deps.remove(dep);
            }
        }
    }

    /// Mark the subscribers of the locations a write affects.
    ///
    /// Returns the number of deps that were hit.
    pub(crate) fn trigger_target(
        &mut self,
        target: ContainerId,
        kind: TargetKind,
        op: TriggerOp,
        key: Option<Key>,
    ) -> usize {
        let Some(keys) = self.targets.get(&target) else {
            return 0;
        };

        let deps: SmallVec<[DepId; 4]> = affected_keys(kind, op, key, keys.keys())
            .iter()
            .filter_map(|key| keys.get(key).copied())
            .collect();

        for dep in &deps {
            self.trigger_dep(*dep, DirtyLevel::Dirty);
        }
        deps.len()
    }

    /// Raise the dirtiness of every current subscriber of `dep` to `level`.
    ///
    /// Computed subscribers pass a maybe-dirty level on to their own
    /// consumers. Subscribers with a scheduler are queued in `pending` unless
    /// they are running and do not allow recursion.
    pub(crate) fn trigger_dep(&mut self, dep: DepId, level: DirtyLevel) {
        let subscribers: SmallVec<[(EffectId, u64); 8]> = match self.deps.get(dep) {
            Some(record) => record
                .subscribers
                .iter()
                .map(|(effect, tracked)| (*effect, *tracked))
                .collect(),
            None => return,
        };

        for (effect, tracked) in subscribers {
            let Some(node) = self.effects.get_mut(effect) else {
                continue;
            };
            if tracked != node.track_id {
                continue;
            }

            if node.dirty < level {
                node.should_schedule |= node.dirty == DirtyLevel::Clean;
                node.dirty = level;
            }
            if !node.should_schedule {
                continue;
            }

            // Cleared while propagating so a cycle of computed values cannot
            // recurse forever; restored below when scheduling is deferred.
            node.should_schedule = false;
            if let Some(own) = node.own_dep {
                let forwarded = if node.dirty == DirtyLevel::MaybeDirtyComputedSideEffect {
                    DirtyLevel::MaybeDirtyComputedSideEffect
                } else {
                    DirtyLevel::MaybeDirty
                };
                self.trigger_dep(own, forwarded);
            }

            let Some(node) = self.effects.get_mut(effect) else {
                continue;
            };
            let may_schedule = (node.runnings == 0 || node.allow_recurse)
                && node.dirty != DirtyLevel::MaybeDirtyComputedSideEffect;
            if may_schedule {
                if node.scheduling.is_some() {
                    self.pending.push_back(effect);
                }
            } else {
                node.should_schedule = true;
            }
        }
    }

    /// Start resolving whether `effect` must re-run.
    ///
    /// A maybe-dirty effect is switched to `Querying` and the computed deps of
    /// its current run are returned for refreshing.
    pub(crate) fn begin_dirty_query(&mut self, effect: EffectId) -> DirtyQuery {
        let Some(node) = self.effects.get_mut(effect) else {
            return DirtyQuery::Resolved(false);
        };
        if !node.dirty.is_maybe_dirty() {
            return DirtyQuery::Resolved(node.dirty >= DirtyLevel::Dirty);
        }

        node.dirty = DirtyLevel::Querying;
        let current: SmallVec<[DepId; 4]> = node.deps[..node.deps_len].iter().copied().collect();
        let sources = current
            .into_iter()
            .filter_map(|dep| self.deps.get(dep).and_then(Dep::computed_source))
            .collect();
        DirtyQuery::Refresh(sources)
    }

    /// Finish a dirty query started by [`Graph::begin_dirty_query`].
    pub(crate) fn finish_dirty_query(&mut self, effect: EffectId) -> bool {
        let Some(node) = self.effects.get_mut(effect) else {
            return false;
        };
        if node.dirty == DirtyLevel::Querying {
            node.dirty = DirtyLevel::Clean;
        }
        node.dirty >= DirtyLevel::Dirty
    }

    pub(crate) fn dirty_level(&self, effect: EffectId) -> Option<DirtyLevel> {
        self.effects.get(effect).map(|node| node.dirty)
    }

    /// Remove every node and dep. The nodes are handed back to be dropped
    /// outside the lock.
    pub(crate) fn clear(&mut self) -> Vec<EffectNode> {
        self.deps.clear();
        self.targets.clear();
        self.pending.clear();
        self.effects.drain().map(|(_, node)| node).collect()
    }

    pub(crate) fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Number of subscribers of a container location.
    pub(crate) fn subscriber_count(&self, target: ContainerId, key: Key) -> usize {
        self.targets
            .get(&target)
            .and_then(|keys| keys.get(&key))
            .and_then(|dep| self.deps.get(*dep))
            .map_or(0, |record| record.subscribers.len())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
