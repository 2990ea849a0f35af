//! Reactive Collections
//!
//! Ordered and associative containers. Besides per-element keys, reads that
//! depend on the shape of the collection track synthetic keys:
//!
//! - `Length` for the length of a vec
//! - `Iterate` for whole-collection reads (iteration, membership scans, size)
//! - `KeyIterate` for the key set of a map, which only structural changes
//!   invalidate
//!
//! Structural writes on a vec (insert, remove, truncate) hit every index at or
//! past the first position that moved.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::graph::{ContainerId, Key, TargetKind, TrackOp, TriggerOp};

use super::container::ContainerInner;
use super::runtime::Runtime;

impl Runtime {
    /// Wrap a new vec.
    pub fn reactive_vec<T>(&self, items: Vec<T>) -> ReactiveVec<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.wrap_vec(&Arc::new(RwLock::new(items)))
    }

    /// Wrap an existing vec. Wrapping the same vec again returns the same
    /// container.
    pub fn wrap_vec<T>(&self, raw: &Arc<RwLock<Vec<T>>>) -> ReactiveVec<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        ReactiveVec {
            inner: self.cached_container(raw, TargetKind::Vec, false),
        }
    }

    /// Wrap a new map.
    pub fn reactive_map<K, V>(&self, entries: IndexMap<K, V>) -> ReactiveMap<K, V>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        self.wrap_map(&Arc::new(RwLock::new(entries)))
    }

    /// Wrap an existing map. Wrapping the same map again returns the same
    /// container.
    pub fn wrap_map<K, V>(&self, raw: &Arc<RwLock<IndexMap<K, V>>>) -> ReactiveMap<K, V>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        ReactiveMap {
            inner: self.cached_container(raw, TargetKind::Map, false),
        }
    }
}

/// A reactive ordered collection.
pub struct ReactiveVec<T> {
    inner: Arc<ContainerInner<Vec<T>>>,
}

impl<T> Clone for ReactiveVec<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ReactiveVec<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn id(&self) -> ContainerId {
        self.inner.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn to_raw(&self) -> Arc<RwLock<Vec<T>>> {
        Arc::clone(&self.inner.raw)
    }

    pub fn len(&self) -> usize {
        self.inner.track(TrackOp::Get, Key::Length);
        self.inner.raw.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get one element, tracking its index.
    pub fn get(&self, index: usize) -> Option<T> {
        self.inner.track(TrackOp::Get, Key::Index(index));
        self.inner.raw.read().get(index).cloned()
    }

    /// Read the whole collection, tracking iteration.
    pub fn with<R>(&self, read: impl FnOnce(&[T]) -> R) -> R {
        self.inner.track(TrackOp::Iterate, Key::Iterate);
        read(self.inner.raw.read().as_slice())
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.with(<[T]>::to_vec)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.inner.track(TrackOp::Has, Key::Iterate);
        self.inner.raw.read().contains(item)
    }

    /// Replace the element at `index`. Subscribers are notified only if it
    /// differs.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&self, index: usize, item: T) -> bool {
        let changed = {
            let mut items = self.inner.raw.write();
            let len = items.len();
            let slot = items
                .get_mut(index)
                .unwrap_or_else(|| panic!("index {index} out of bounds for length {len}"));
            if *slot == item {
                false
            } else {
                *slot = item;
                true
            }
        };
        if changed {
            self.inner.trigger(TriggerOp::Set, Some(Key::Index(index)));
        }
        changed
    }

    pub fn push(&self, item: T) {
        let index = {
            let mut items = self.inner.raw.write();
            items.push(item);
            items.len() - 1
        };
        self.inner.trigger(TriggerOp::Add, Some(Key::Index(index)));
    }

    pub fn pop(&self) -> Option<T> {
        let (item, index) = {
            let mut items = self.inner.raw.write();
            let item = items.pop()?;
            (item, items.len())
        };
        self.inner.trigger(TriggerOp::Delete, Some(Key::Index(index)));
        Some(item)
    }

    /// # Panics
    ///
    /// Panics if `index > len`.
    pub fn insert(&self, index: usize, item: T) {
        self.inner.raw.write().insert(index, item);
        self.inner.trigger(TriggerOp::Splice { from: index }, None);
    }

    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove(&self, index: usize) -> T {
        let item = self.inner.raw.write().remove(index);
        self.inner.trigger(TriggerOp::Splice { from: index }, None);
        item
    }

    pub fn truncate(&self, len: usize) {
        let shrunk = {
            let mut items = self.inner.raw.write();
            let shrunk = len < items.len();
            items.truncate(len);
            shrunk
        };
        if shrunk {
            self.inner.trigger(TriggerOp::Splice { from: len }, None);
        }
    }

    /// Keep the elements `keep` accepts. Reads inside `keep` are not tracked.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) {
        let first_removed = {
            let _paused = self.inner.runtime.pause_tracking();
            let mut items = self.inner.raw.write();
            let mut first = None;
            let mut index = 0;
            items.retain(|item| {
                let kept = keep(item);
                if !kept && first.is_none() {
                    first = Some(index);
                }
                index += 1;
                kept
            });
            first
        };
        if let Some(from) = first_removed {
            self.inner.trigger(TriggerOp::Splice { from }, None);
        }
    }

    /// Append every item. Subscribers are scheduled once for the whole batch.
    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        self.inner.runtime.batch(|| {
            for item in items {
                self.push(item);
            }
        });
    }

    pub fn clear(&self) {
        let had_items = {
            let mut items = self.inner.raw.write();
            let had_items = !items.is_empty();
            items.clear();
            had_items
        };
        if had_items {
            self.inner.trigger(TriggerOp::Clear, None);
        }
    }
}

impl<T> PartialEq for ReactiveVec<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for ReactiveVec<T> {}

impl<T: fmt::Debug> fmt::Debug for ReactiveVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveVec")
            .field("id", &self.inner.id)
            .field("items", &*self.inner.raw.read())
            .finish()
    }
}

/// A reactive associative collection. Iteration follows insertion order.
pub struct ReactiveMap<K, V> {
    inner: Arc<ContainerInner<IndexMap<K, V>>>,
}

impl<K, V> Clone for ReactiveMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> ReactiveMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn id(&self) -> ContainerId {
        self.inner.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn to_raw(&self) -> Arc<RwLock<IndexMap<K, V>>> {
        Arc::clone(&self.inner.raw)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.track(TrackOp::Get, Key::entry(key));
        self.inner.raw.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.track(TrackOp::Has, Key::entry(key));
        self.inner.raw.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.track(TrackOp::Iterate, Key::Iterate);
        self.inner.raw.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the whole map, tracking iteration.
    pub fn with<R>(&self, read: impl FnOnce(&IndexMap<K, V>) -> R) -> R {
        self.inner.track(TrackOp::Iterate, Key::Iterate);
        read(&*self.inner.raw.read())
    }

    /// The keys in insertion order. Only additions and removals notify.
    pub fn keys(&self) -> Vec<K> {
        self.inner.track(TrackOp::Iterate, Key::KeyIterate);
        self.inner.raw.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.track(TrackOp::Iterate, Key::Iterate);
        self.inner.raw.read().values().cloned().collect()
    }

    /// Insert or replace an entry. Replacing with an equal value does not
    /// notify.
    ///
    /// Returns the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let dep_key = Key::entry(&key);
        let (previous, op) = {
            let mut entries = self.inner.raw.write();
            match entries.get_mut(&key) {
                Some(slot) if *slot == value => (Some(value), None),
                Some(slot) => (Some(std::mem::replace(slot, value)), Some(TriggerOp::Set)),
                None => {
                    entries.insert(key, value);
                    (None, Some(TriggerOp::Add))
                }
            }
        };
        if let Some(op) = op {
            self.inner.trigger(op, Some(dep_key));
        }
        previous
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.inner.raw.write().shift_remove(key)?;
        self.inner.trigger(TriggerOp::Delete, Some(Key::entry(key)));
        Some(removed)
    }

    pub fn clear(&self) {
        let had_entries = {
            let mut entries = self.inner.raw.write();
            let had_entries = !entries.is_empty();
            entries.clear();
            had_entries
        };
        if had_entries {
            self.inner.trigger(TriggerOp::Clear, None);
        }
    }
}

impl<K, V> PartialEq for ReactiveMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<K, V> Eq for ReactiveMap<K, V> {}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for ReactiveMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveMap")
            .field("id", &self.inner.id)
            .field("entries", &*self.inner.raw.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::*;

    fn counted<F>(runtime: &Runtime, read: F) -> Arc<AtomicI32>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let runs = Arc::new(AtomicI32::new(0));
        let counter = runs.clone();
        runtime.effect(move || {
            read();
            counter.fetch_add(1, Ordering::SeqCst);
        });
        runs
    }

    #[test]
    fn length_readers_ignore_in_place_sets() {
        let runtime = Runtime::new();
        let items = runtime.reactive_vec(vec![1, 2, 3]);

        let reader = items.clone();
        let runs = counted(&runtime, move || {
            reader.len();
        });

        items.set(0, 10);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        items.push(4);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        items.pop();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn index_readers_see_shifts() {
        let runtime = Runtime::new();
        let items = runtime.reactive_vec(vec!["a", "b", "c"]);

        let reader = items.clone();
        let runs = counted(&runtime, move || {
            reader.get(2);
        });

        // Index 2 is untouched by a change at 0.
        items.set(0, "z");
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Removing index 1 moves index 2.
        items.remove(1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        items.insert(0, "y");
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(items.to_vec(), vec!["y", "z", "c"]);
    }

    #[test]
    fn push_hits_readers_of_the_new_index() {
        let runtime = Runtime::new();
        let items = runtime.reactive_vec(Vec::<i32>::new());

        let reader = items.clone();
        let runs = counted(&runtime, move || {
            reader.get(0);
        });

        items.push(7);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn extend_schedules_once() {
        let runtime = Runtime::new();
        let items = runtime.reactive_vec(vec![0]);

        let reader = items.clone();
        let runs = counted(&runtime, move || {
            reader.with(|items| items.len());
        });

        items.extend([1, 2, 3, 4]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(items.to_vec(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn retain_and_truncate() {
        let runtime = Runtime::new();
        let items = runtime.reactive_vec(vec![1, 2, 3, 4, 5, 6]);

        let reader = items.clone();
        let runs = counted(&runtime, move || {
            reader.get(0);
        });

        // Only index 1 and later move.
        items.retain(|n| n % 2 == 1);
        assert_eq!(items.to_vec(), vec![1, 3, 5]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        items.truncate(5);
        items.truncate(0);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(items.is_empty());
    }

    #[test]
    fn map_key_iteration_ignores_value_changes() {
        let runtime = Runtime::new();
        let scores = runtime.reactive_map(IndexMap::from([("ada", 1), ("grace", 2)]));

        let reader = scores.clone();
        let key_runs = counted(&runtime, move || {
            reader.keys();
        });
        let reader = scores.clone();
        let value_runs = counted(&runtime, move || {
            reader.values();
        });

        scores.insert("ada", 5);
        assert_eq!(key_runs.load(Ordering::SeqCst), 1);
        assert_eq!(value_runs.load(Ordering::SeqCst), 2);

        scores.insert("linus", 3);
        assert_eq!(key_runs.load(Ordering::SeqCst), 2);
        assert_eq!(value_runs.load(Ordering::SeqCst), 3);

        scores.remove(&"grace");
        assert_eq!(key_runs.load(Ordering::SeqCst), 3);
        assert_eq!(scores.keys(), vec!["ada", "linus"]);
    }

    #[test]
    fn map_entry_readers_are_precise() {
        let runtime = Runtime::new();
        let scores = runtime.reactive_map(IndexMap::<String, i32>::new());

        let reader = scores.clone();
        let runs = counted(&runtime, move || {
            reader.contains_key(&"ada".to_string());
        });

        scores.insert("grace".into(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scores.insert("ada".into(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // Same value: nothing to notify.
        assert_eq!(scores.insert("ada".into(), 1), Some(1));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        scores.clear();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(scores.is_empty());
    }

    #[test]
    fn vec_and_object_wrappers_of_one_value_are_distinct() {
        let runtime = Runtime::new();
        let raw = Arc::new(RwLock::new(vec![1]));

        let as_vec = runtime.wrap_vec(&raw);
        let as_object = runtime.wrap(&raw);
        assert_ne!(as_vec.id(), as_object.id());
        assert_eq!(runtime.wrap_vec(&raw), as_vec);
    }
}
