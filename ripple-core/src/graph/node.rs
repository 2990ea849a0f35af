//! Graph Nodes
//!
//! This module defines the records that live in the dependency arena:
//! effect nodes (plain effects and the effects behind computed values) and
//! deps (the subscriber sets of state locations).

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use slotmap::new_key_type;
use smallvec::SmallVec;

use super::key::{ContainerId, Key};
use crate::reactive::Scheduling;

new_key_type! {
    /// Arena key of an effect node.
    pub struct EffectId;

    /// Arena key of a dep.
    pub struct DepId;
}

/// Body of a plain effect.
pub(crate) type EffectFn = Arc<dyn Fn() + Send + Sync>;

/// Hook run once when an effect stops.
pub(crate) type StopHook = Box<dyn FnOnce() + Send>;

/// Staleness of an effect or computed value.
///
/// Levels are ordered: raising a node's level never lowers it, and anything at
/// or above [`DirtyLevel::Dirty`] must re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DirtyLevel {
    /// Up to date.
    Clean = 0,
    /// Currently resolving a maybe-dirty state by refreshing computed deps.
    Querying = 1,
    /// A computed dependency changed while it was being evaluated by a getter
    /// with side effects.
    MaybeDirtyComputedSideEffect = 2,
    /// A computed dependency may have changed; refresh it to find out.
    MaybeDirty = 3,
    /// A direct dependency changed.
    Dirty = 4,
}

impl DirtyLevel {
    /// Whether the level must be resolved by refreshing computed deps.
    pub fn is_maybe_dirty(self) -> bool {
        matches!(
            self,
            DirtyLevel::MaybeDirty | DirtyLevel::MaybeDirtyComputedSideEffect
        )
    }
}

/// Whether an effect node backs a plain effect or a computed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Effect,
    Computed,
}

/// A computed value as seen by the graph.
///
/// Deps owned by a computed keep a weak reference to it so that resolving a
/// maybe-dirty effect can pull fresh values through it.
pub(crate) trait ComputedSource: Send + Sync {
    /// Bring the cached value up to date without tracking the read.
    fn refresh(&self);
}

/// An effect in the arena.
pub(crate) struct EffectNode {
    pub(crate) kind: NodeKind,
    pub(crate) label: Arc<str>,
    pub(crate) dirty: DirtyLevel,

    /// Generation counter, bumped at the start of every run. A dep records
    /// the generation that last tracked the effect; a stale generation means
    /// the dependency was not read in the current run.
    pub(crate) track_id: u64,

    /// Deps this effect is registered in, in the order they were tracked.
    /// Only the first `deps_len` entries belong to the current run.
    pub(crate) deps: SmallVec<[DepId; 4]>,
    pub(crate) deps_len: usize,

    /// Nested run count, the recursion guard.
    pub(crate) runnings: u32,
    pub(crate) should_schedule: bool,
    pub(crate) allow_recurse: bool,

    /// For computed nodes, the dep consumers of the value subscribe to.
    /// Created lazily on first tracked read.
    pub(crate) own_dep: Option<DepId>,

    pub(crate) scheduling: Option<Scheduling>,
    pub(crate) body: Option<EffectFn>,
    pub(crate) on_stop: Option<StopHook>,
}

impl EffectNode {
    /// Create a plain effect node. It starts dirty so its first run tracks.
    pub(crate) fn effect(label: Arc<str>, body: EffectFn, scheduling: Scheduling) -> Self {
        Self {
            kind: NodeKind::Effect,
            label,
            dirty: DirtyLevel::Dirty,
            track_id: 0,
            deps: SmallVec::new(),
            deps_len: 0,
            runnings: 0,
            should_schedule: false,
            allow_recurse: false,
            own_dep: None,
            scheduling: Some(scheduling),
            body: Some(body),
            on_stop: None,
        }
    }

    /// Create the node behind a computed value. Computed nodes have no
    /// scheduler; their consumers are notified through `own_dep` instead.
    pub(crate) fn computed(label: Arc<str>) -> Self {
        Self {
            kind: NodeKind::Computed,
            label,
            dirty: DirtyLevel::Dirty,
            track_id: 0,
            deps: SmallVec::new(),
            deps_len: 0,
            runnings: 0,
            should_schedule: false,
            allow_recurse: false,
            own_dep: None,
            scheduling: None,
            body: None,
            on_stop: None,
        }
    }

    /// Begin a run: mark clean, bump the generation and rewind the dep cursor.
    pub(crate) fn begin_run(&mut self) {
        self.dirty = DirtyLevel::Clean;
        self.runnings += 1;
        self.track_id += 1;
        self.deps_len = 0;
    }
}

/// Who a dep belongs to.
pub(crate) enum DepOwner {
    /// A location inside a container.
    Target { target: ContainerId, key: Key },
    /// The value of a computed.
    Computed {
        node: EffectId,
        source: Weak<dyn ComputedSource>,
    },
}

/// The subscriber set of one state location.
pub(crate) struct Dep {
    /// Subscribed effects mapped to the generation that last tracked them,
    /// in subscription order.
    pub(crate) subscribers: IndexMap<EffectId, u64>,
    pub(crate) owner: DepOwner,
}

impl Dep {
    pub(crate) fn new(owner: DepOwner) -> Self {
        Self {
            subscribers: IndexMap::new(),
            owner,
        }
    }

    /// The computed value behind this dep, if it belongs to one that is alive.
    pub(crate) fn computed_source(&self) -> Option<Arc<dyn ComputedSource>> {
        match &self.owner {
            DepOwner::Computed { source, .. } => source.upgrade(),
            DepOwner::Target { .. } => None,
        }
    }
}
