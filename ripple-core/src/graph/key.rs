//! Dependency Keys
//!
//! A dependency is addressed by the container that owns the state and a key
//! naming the location inside it. Besides per-location keys there are
//! synthetic keys for reads that depend on the shape of a collection rather
//! than on one element.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a reactive container.
///
/// Every container (object, vec, map or ref) gets one when it is wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);

impl ContainerId {
    /// Generate a new unique container ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

/// A location inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// The single value held by a `Ref`.
    Value,
    /// A named field of an object container.
    Field(&'static str),
    /// An element of an ordered collection.
    Index(usize),
    /// The length of an ordered collection.
    Length,
    /// An entry of an associative collection, addressed by the hash of its key.
    Entry(u64),
    /// Whole-container reads: iteration, membership scans, size of a map and
    /// whole-value reads of an object.
    Iterate,
    /// Iteration over the keys of an associative collection. Only structural
    /// changes invalidate it.
    KeyIterate,
}

impl Key {
    /// Key for a map entry.
    ///
    /// Entries are addressed by hash, so two keys that collide share a
    /// dependency. A collision can only cause an extra re-run, never a missed one.
    pub fn entry<K: Hash + ?Sized>(key: &K) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Key::Entry(hasher.finish())
    }
}

/// Kind of read being tracked. Reported in trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOp {
    Get,
    Has,
    Iterate,
}

/// Kind of write being triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOp {
    /// An existing location changed value.
    Set,
    /// A new location appeared.
    Add,
    /// A location was removed.
    Delete,
    /// Every location of the container changed.
    Clear,
    /// Elements of an ordered collection shifted or were dropped starting at
    /// `from`; every index at or beyond it is affected.
    Splice { from: usize },
}

/// The shape of a container, which decides which synthetic keys a write hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Value,
    Object,
    Vec,
    Map,
}

/// Resolve which keys of a target are affected by a write.
///
/// `present` lists the keys that currently have a dependency; only those are
/// returned.
pub(crate) fn affected_keys<'a>(
    kind: TargetKind,
    op: TriggerOp,
    key: Option<Key>,
    present: impl Iterator<Item = &'a Key>,
) -> Vec<Key> {
    let mut wanted: Vec<Key> = Vec::with_capacity(4);

    match op {
        TriggerOp::Clear => return present.copied().collect(),
        TriggerOp::Splice { from } => {
            return present
                .copied()
                .filter(|k| match k {
                    Key::Index(i) => *i >= from,
                    Key::Length | Key::Iterate => true,
                    Key::Value => kind == TargetKind::Value,
                    _ => false,
                })
                .collect();
        }
        TriggerOp::Set | TriggerOp::Add | TriggerOp::Delete => {
            if let Some(key) = key {
                wanted.push(key);
            }
            if kind != TargetKind::Value {
                wanted.push(Key::Iterate);
            }
            if matches!(op, TriggerOp::Add | TriggerOp::Delete) {
                match kind {
                    TargetKind::Vec => wanted.push(Key::Length),
                    TargetKind::Map => wanted.push(Key::KeyIterate),
                    _ => {}
                }
            }
        }
    }

    let present: Vec<Key> = present.copied().collect();
    wanted.dedup();
    wanted.retain(|k| present.contains(k));
    wanted
}
