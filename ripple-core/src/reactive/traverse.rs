//! Deep Traversal
//!
//! A deep watcher must depend on every container reachable from its source,
//! not only on the ones it reads directly. [`Traverse`] walks a value and
//! tracks each container it meets.
//!
//! Plain values are leaves. Containers count as one level each; a
//! [`Traversal`] stops descending once the configured depth is used up. It
//! remembers the depth each container was entered with, so cyclic structures
//! do not loop and a container reached again closer to the root is walked
//! again with the deeper budget.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::graph::{ContainerId, Key, TrackOp};

use super::cell::Ref;
use super::collections::{ReactiveMap, ReactiveVec};
use super::computed::Computed;
use super::container::Reactive;

/// State of one deep traversal.
#[derive(Debug, Clone, Default)]
pub struct Traversal {
    remaining: Option<usize>,
    /// Depth budget each container was last entered with.
    seen: HashMap<ContainerId, Option<usize>>,
}

impl Traversal {
    /// Start a traversal visiting at most `levels` containers deep, `None`
    /// meaning no limit.
    pub fn new(levels: Option<usize>) -> Self {
        Self {
            remaining: levels,
            seen: HashMap::new(),
        }
    }

    /// Visit a container. `descend` runs one level deeper, unless the depth
    /// is used up or the container was already entered with at least the
    /// current budget.
    pub fn visit(&mut self, container: ContainerId, descend: impl FnOnce(&mut Self)) {
        if self.remaining == Some(0) {
            return;
        }
        let deeper = match self.seen.get(&container) {
            None => true,
            Some(entered) => exceeds(self.remaining, *entered),
        };
        if !deeper {
            return;
        }
        self.seen.insert(container, self.remaining);

        let saved = self.remaining;
        self.remaining = saved.map(|levels| levels - 1);
        descend(self);
        self.remaining = saved;
    }

    /// Number of containers visited so far.
    pub fn visited(&self) -> usize {
        self.seen.len()
    }
}

/// Whether budget `a` reaches further than budget `b`, `None` being unlimited.
fn exceeds(a: Option<usize>, b: Option<usize>) -> bool {
    match (a, b) {
        (None, Some(_)) => true,
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}

/// Values a deep watcher can walk.
///
/// The default implementation is a leaf, so plain data types only need an
/// empty `impl Traverse for MyType {}`.
pub trait Traverse {
    fn traverse(&self, traversal: &mut Traversal) {
        let _ = traversal;
    }
}

macro_rules! leaf {
    ($($ty:ty),* $(,)?) => {
        $(impl Traverse for $ty {})*
    };
}

leaf!(
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64,
    String, &'static str,
);

impl<T: Traverse> Traverse for Option<T> {
    fn traverse(&self, traversal: &mut Traversal) {
        if let Some(value) = self {
            value.traverse(traversal);
        }
    }
}

impl<T: Traverse> Traverse for Vec<T> {
    fn traverse(&self, traversal: &mut Traversal) {
        for item in self {
            item.traverse(traversal);
        }
    }
}

impl<T: Traverse + ?Sized> Traverse for Box<T> {
    fn traverse(&self, traversal: &mut Traversal) {
        (**self).traverse(traversal);
    }
}

impl<T: Traverse + ?Sized> Traverse for Arc<T> {
    fn traverse(&self, traversal: &mut Traversal) {
        (**self).traverse(traversal);
    }
}

impl<K, V: Traverse, S> Traverse for HashMap<K, V, S> {
    fn traverse(&self, traversal: &mut Traversal) {
        for value in self.values() {
            value.traverse(traversal);
        }
    }
}

impl<K, V: Traverse> Traverse for BTreeMap<K, V> {
    fn traverse(&self, traversal: &mut Traversal) {
        for value in self.values() {
            value.traverse(traversal);
        }
    }
}

impl<K, V: Traverse, S> Traverse for IndexMap<K, V, S> {
    fn traverse(&self, traversal: &mut Traversal) {
        for value in self.values() {
            value.traverse(traversal);
        }
    }
}

impl<A: Traverse, B: Traverse> Traverse for (A, B) {
    fn traverse(&self, traversal: &mut Traversal) {
        self.0.traverse(traversal);
        self.1.traverse(traversal);
    }
}

impl<A: Traverse, B: Traverse, C: Traverse> Traverse for (A, B, C) {
    fn traverse(&self, traversal: &mut Traversal) {
        self.0.traverse(traversal);
        self.1.traverse(traversal);
        self.2.traverse(traversal);
    }
}

impl<T> Traverse for Reactive<T>
where
    T: Traverse + Send + Sync + 'static,
{
    fn traverse(&self, traversal: &mut Traversal) {
        traversal.visit(self.id(), |traversal| {
            self.with(|value| value.traverse(traversal));
        });
    }
}

impl<T> Traverse for ReactiveVec<T>
where
    T: Traverse + Clone + PartialEq + Send + Sync + 'static,
{
    fn traverse(&self, traversal: &mut Traversal) {
        traversal.visit(self.id(), |traversal| {
            self.with(|items| {
                for item in items {
                    item.traverse(traversal);
                }
            });
        });
    }
}

impl<K, V> Traverse for ReactiveMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Traverse + Clone + PartialEq + Send + Sync + 'static,
{
    fn traverse(&self, traversal: &mut Traversal) {
        traversal.visit(self.id(), |traversal| {
            // Iteration covers value changes; key iteration covers additions
            // and removals.
            self.runtime().track(self.id(), TrackOp::Iterate, Key::KeyIterate);
            self.with(|entries| entries.values().for_each(|value| value.traverse(traversal)));
        });
    }
}

impl<T> Traverse for Ref<T>
where
    T: Traverse + Clone + PartialEq + Send + Sync + 'static,
{
    fn traverse(&self, traversal: &mut Traversal) {
        traversal.visit(self.id(), |traversal| {
            self.with(|value| value.traverse(traversal));
        });
    }
}

impl<T> Traverse for Computed<T>
where
    T: Traverse + Clone + PartialEq + Send + Sync + 'static,
{
    fn traverse(&self, traversal: &mut Traversal) {
        self.get().traverse(traversal);
    }
}
