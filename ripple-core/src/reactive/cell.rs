//! Ref Implementation
//!
//! A Ref is the smallest container: one value behind one implicit key.
//!
//! # How Refs Work
//!
//! 1. Reading the value inside a running effect registers the effect as a
//!    subscriber of the ref.
//!
//! 2. Setting a different value notifies every subscriber. Setting an equal
//!    value does nothing.
//!
//! 3. In-place changes go through [`Ref::update`], which always notifies, or
//!    are announced afterwards with [`Ref::trigger`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::graph::{ContainerId, Key, TargetKind, TrackOp, TriggerOp};

use super::container::ContainerInner;
use super::runtime::Runtime;

/// A reactive cell holding a value of type T.
///
/// # Example
///
/// ```rust,ignore
/// let count = runtime.create_ref(0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (notifies subscribers)
/// count.set(5);
/// ```
pub struct Ref<T> {
    inner: Arc<ContainerInner<T>>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Runtime {
    /// Create a ref holding `value`.
    pub fn create_ref<T>(&self, value: T) -> Ref<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let raw = Arc::new(RwLock::new(value));
        Ref {
            inner: Arc::new(ContainerInner::new(self.clone(), raw, TargetKind::Value, false)),
        }
    }
}

impl<T> Ref<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn id(&self) -> ContainerId {
        self.inner.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Get the current value, tracking the read.
    pub fn get(&self) -> T {
        self.inner.track(TrackOp::Get, Key::Value);
        self.inner.raw.read().clone()
    }

    /// Read the value in place, tracking the read.
    pub fn with<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        self.inner.track(TrackOp::Get, Key::Value);
        read(&*self.inner.raw.read())
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        self.inner.raw.read().clone()
    }

    /// Set a new value. Subscribers are notified only if it differs.
    ///
    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> bool {
        let changed = {
            let mut current = self.inner.raw.write();
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        };
        if changed {
            self.inner.trigger(TriggerOp::Set, Some(Key::Value));
        }
        changed
    }

    /// Mutate the value in place and notify subscribers.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let _paused = self.inner.runtime.pause_tracking();
            mutate(&mut *self.inner.raw.write())
        };
        self.trigger();
        result
    }

    /// Notify subscribers without changing the value.
    pub fn trigger(&self) {
        self.inner.trigger(TriggerOp::Set, Some(Key::Value));
    }
}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for Ref<T> {}

impl<T> fmt::Debug for Ref<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.raw.read())
            .finish()
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::*;

    #[test]
    fn ref_basic_operations() {
        let runtime = Runtime::new();
        let cell = runtime.create_ref(42);
        assert_eq!(cell.get(), 42);

        assert!(cell.set(100));
        assert_eq!(cell.get(), 100);
        assert!(!cell.set(100));
    }

    #[test]
    fn ref_update() {
        let runtime = Runtime::new();
        let cell = runtime.create_ref(vec![1, 2]);
        let len = cell.update(|v| {
            v.push(3);
            v.len()
        });
        assert_eq!(len, 3);
        assert_eq!(cell.with(|v| v.iter().sum::<i32>()), 6);
    }

    #[test]
    fn effect_reruns_on_change_only() {
        let runtime = Runtime::new();
        let cell = runtime.create_ref(1);
        let seen = Arc::new(AtomicI32::new(0));
        let runs = Arc::new(AtomicI32::new(0));

        let reader = cell.clone();
        let sink = seen.clone();
        let counter = runs.clone();
        runtime.effect(move || {
            sink.store(reader.get() * 2, Ordering::SeqCst);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cell.set(5);
        assert_eq!(seen.load(Ordering::SeqCst), 10);
        cell.set(5);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // A manual trigger re-runs even though the value is unchanged.
        cell.trigger();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn untracked_reads_do_not_subscribe() {
        let runtime = Runtime::new();
        let cell = runtime.create_ref(0);
        let runs = Arc::new(AtomicI32::new(0));

        let reader = cell.clone();
        let counter = runs.clone();
        let rt = runtime.clone();
        runtime.effect(move || {
            reader.get_untracked();
            rt.untracked(|| reader.get());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cell.set(1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.stats().deps, 0);
    }
}
