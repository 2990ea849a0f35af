//! Reactive Containers
//!
//! A container wraps one underlying value so that reads and writes through
//! it are observable. Reads made while an effect is running register the
//! effect as a subscriber of the location read; writes notify the
//! subscribers of the locations they change.
//!
//! # Identity
//!
//! Wrapping the same underlying value twice yields the same container. The
//! runtime keeps a cache from the address of the value to a weak reference
//! to its container, with separate entries for deep and shallow wrappers.
//! The entry goes away with the last handle, and so do the container's deps.
//!
//! # Locking
//!
//! The underlying value sits behind a `parking_lot::RwLock`. A write holds
//! the lock only while applying the change; subscribers are notified after
//! it is released, so an effect re-run inline can read the container again.
//! Closures passed to readers run with the read lock held and must not write
//! to the same container.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::graph::{ContainerId, Key, TargetKind, TrackOp, TriggerOp};

use super::runtime::{CacheKey, Runtime};

/// State shared by every handle to one container.
pub(crate) struct ContainerInner<T> {
    pub(crate) id: ContainerId,
    pub(crate) runtime: Runtime,
    pub(crate) raw: Arc<RwLock<T>>,
    pub(crate) kind: TargetKind,
    pub(crate) shallow: bool,
    cache_key: Option<CacheKey>,
}

impl<T> ContainerInner<T> {
    pub(crate) fn new(runtime: Runtime, raw: Arc<RwLock<T>>, kind: TargetKind, shallow: bool) -> Self {
        Self {
            id: ContainerId::new(),
            runtime,
            raw,
            kind,
            shallow,
            cache_key: None,
        }
    }

    pub(crate) fn track(&self, op: TrackOp, key: Key) {
        self.runtime.track(self.id, op, key);
    }

    pub(crate) fn trigger(&self, op: TriggerOp, key: Option<Key>) {
        self.runtime.trigger(self.id, self.kind, op, key);
    }
}

impl<T> Drop for ContainerInner<T> {
    fn drop(&mut self) {
        if let Some(key) = self.cache_key {
            self.runtime
                .wrappers()
                .remove_if(&key, |_, cached| cached.strong_count() == 0);
        }
        self.runtime.graph().forget_target(self.id);
    }
}

fn cache_key<T>(raw: &Arc<RwLock<T>>, kind: TargetKind, shallow: bool) -> CacheKey {
    (Arc::as_ptr(raw) as *const () as usize, kind, shallow)
}

impl Runtime {
    /// Look up the container wrapping `raw`, creating and caching it if
    /// there is none.
    pub(crate) fn cached_container<T>(
        &self,
        raw: &Arc<RwLock<T>>,
        kind: TargetKind,
        shallow: bool,
    ) -> Arc<ContainerInner<T>>
    where
        T: Send + Sync + 'static,
    {
        let key = cache_key(raw, kind, shallow);
        let existing = self
            .wrappers()
            .get(&key)
            .and_then(|cached| cached.value().upgrade());
        if let Some(existing) = existing {
            if let Ok(container) = existing.downcast::<ContainerInner<T>>() {
                return container;
            }
        }

        let mut inner = ContainerInner::new(self.clone(), Arc::clone(raw), kind, shallow);
        inner.cache_key = Some(key);
        let container = Arc::new(inner);
        let erased: Arc<dyn Any + Send + Sync> = container.clone();
        self.wrappers().insert(key, Arc::downgrade(&erased));
        container
    }

    /// Wrap a new value as an object container.
    pub fn reactive<T>(&self, value: T) -> Reactive<T>
    where
        T: Send + Sync + 'static,
    {
        self.wrap(&Arc::new(RwLock::new(value)))
    }

    /// Wrap a new value as a shallow object container. See
    /// [`Reactive::is_shallow`] for what shallow changes.
    pub fn shallow_reactive<T>(&self, value: T) -> Reactive<T>
    where
        T: Send + Sync + 'static,
    {
        self.wrap_shallow(&Arc::new(RwLock::new(value)))
    }

    /// Wrap an existing value. Wrapping the same value again returns the same
    /// container.
    pub fn wrap<T>(&self, raw: &Arc<RwLock<T>>) -> Reactive<T>
    where
        T: Send + Sync + 'static,
    {
        Reactive {
            inner: self.cached_container(raw, TargetKind::Object, false),
        }
    }

    /// Like [`Runtime::wrap`], for a shallow container. Deep and shallow
    /// wrappers of one value are distinct.
    pub fn wrap_shallow<T>(&self, raw: &Arc<RwLock<T>>) -> Reactive<T>
    where
        T: Send + Sync + 'static,
    {
        Reactive {
            inner: self.cached_container(raw, TargetKind::Object, true),
        }
    }
}

/// An object container: a value with named fields.
///
/// Fields are addressed by name and reached through accessor closures, so
/// any struct can be wrapped without extra derives.
///
/// # Example
///
/// ```rust,ignore
/// let user = runtime.reactive(User { name: "ada".into(), age: 36 });
///
/// runtime.effect({
///     let user = user.clone();
///     move || println!("{}", user.get("name", |u| u.name.clone()))
/// });
///
/// user.set("age", |u| &mut u.age, 37); // no effect re-runs: `age` was not read
/// ```
pub struct Reactive<T> {
    inner: Arc<ContainerInner<T>>,
}

impl<T> Clone for Reactive<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Reactive<T>
where
    T: Send + Sync + 'static,
{
    pub fn id(&self) -> ContainerId {
        self.inner.id
    }

    /// Whether this is a shallow wrapper.
    ///
    /// Shallowness only affects watchers: a watcher on a shallow container
    /// traverses one level instead of the whole value. Field reads and writes
    /// are tracked and triggered the same way as on a deep wrapper.
    pub fn is_shallow(&self) -> bool {
        self.inner.shallow
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// The underlying value.
    pub fn to_raw(&self) -> Arc<RwLock<T>> {
        Arc::clone(&self.inner.raw)
    }

    /// Read one field, tracking it.
    pub fn get<R>(&self, field: &'static str, projection: impl FnOnce(&T) -> R) -> R {
        self.inner.track(TrackOp::Get, Key::Field(field));
        projection(&*self.inner.raw.read())
    }

    /// Read the whole value, tracking every field.
    pub fn with<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        self.inner.track(TrackOp::Iterate, Key::Iterate);
        read(&*self.inner.raw.read())
    }

    /// Read the whole value without tracking.
    pub fn with_untracked<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        read(&*self.inner.raw.read())
    }

    /// Write one field. Subscribers are notified only if the value changed.
    ///
    /// Returns whether the value changed.
    pub fn set<V>(&self, field: &'static str, accessor: impl FnOnce(&mut T) -> &mut V, value: V) -> bool
    where
        V: PartialEq,
    {
        let changed = {
            let mut raw = self.inner.raw.write();
            let slot = accessor(&mut *raw);
            if *slot == value {
                false
            } else {
                *slot = value;
                true
            }
        };
        if changed {
            self.inner.trigger(TriggerOp::Set, Some(Key::Field(field)));
        }
        changed
    }

    /// Mutate one field in place. Subscribers of the field are always
    /// notified.
    pub fn update<R>(&self, field: &'static str, mutate: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let _paused = self.inner.runtime.pause_tracking();
            mutate(&mut *self.inner.raw.write())
        };
        self.inner.trigger(TriggerOp::Set, Some(Key::Field(field)));
        result
    }

    /// Replace the whole value. Every subscriber of the container is notified.
    pub fn replace(&self, value: T) -> T {
        let previous = std::mem::replace(&mut *self.inner.raw.write(), value);
        self.inner
            .runtime
            .batch(|| self.inner.trigger(TriggerOp::Clear, None));
        previous
    }
}

impl<T> PartialEq for Reactive<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for Reactive<T> {}

impl<T> fmt::Debug for Reactive<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactive")
            .field("id", &self.inner.id)
            .field("shallow", &self.inner.shallow)
            .field("value", &*self.inner.raw.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Profile {
        name: String,
        age: u32,
    }

    fn profile() -> Profile {
        Profile {
            name: "ada".into(),
            age: 36,
        }
    }

    #[test]
    fn wrapping_is_idempotent_per_identity() {
        let runtime = Runtime::new();
        let raw = Arc::new(RwLock::new(profile()));

        let a = runtime.wrap(&raw);
        let b = runtime.wrap(&raw);
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.to_raw(), &raw));

        // Shallow wrappers are cached separately.
        let shallow = runtime.wrap_shallow(&raw);
        assert_ne!(a.id(), shallow.id());
        assert_eq!(shallow, runtime.wrap_shallow(&raw));

        // A fresh container is reachable again through its raw value.
        let fresh = runtime.reactive(profile());
        assert_eq!(runtime.wrap(&fresh.to_raw()), fresh);
    }

    #[test]
    fn cache_entry_dies_with_last_handle() {
        let runtime = Runtime::new();
        let raw = Arc::new(RwLock::new(1));

        let first = runtime.wrap(&raw);
        let first_id = first.id();
        assert_eq!(runtime.stats().cached_wrappers, 1);

        drop(first);
        assert_eq!(runtime.stats().cached_wrappers, 0);
        assert_ne!(runtime.wrap(&raw).id(), first_id);
    }

    #[test]
    fn field_reads_are_tracked_per_field() {
        let runtime = Runtime::new();
        let user = runtime.reactive(profile());
        let runs = Arc::new(AtomicI32::new(0));

        let reader = user.clone();
        let counter = runs.clone();
        runtime.effect(move || {
            reader.get("name", |p| p.name.clone());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert!(user.set("age", |p| &mut p.age, 37));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert!(user.set("name", |p| &mut p.name, "grace".to_string()));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // Same value: no notification.
        assert!(!user.set("name", |p| &mut p.name, "grace".to_string()));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn shallow_wrapper_tracks_fields_like_deep() {
        let runtime = Runtime::new();
        let user = runtime.shallow_reactive(profile());
        assert!(user.is_shallow());
        let runs = Arc::new(AtomicI32::new(0));

        let reader = user.clone();
        let counter = runs.clone();
        runtime.effect(move || {
            reader.get("name", |p| p.name.clone());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(user.set("age", |p| &mut p.age, 37));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert!(user.set("name", |p| &mut p.name, "grace".to_string()));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn whole_value_reads_see_every_write() {
        let runtime = Runtime::new();
        let user = runtime.reactive(profile());
        let runs = Arc::new(AtomicI32::new(0));

        let reader = user.clone();
        let counter = runs.clone();
        runtime.effect(move || {
            reader.with(|p| p.age);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        user.update("age", |p| p.age += 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let previous = user.replace(profile());
        assert_eq!(previous.age, 37);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn deps_are_forgotten_with_the_container() {
        let runtime = Runtime::new();
        let user = runtime.reactive(profile());

        let reader = user.clone();
        let effect = runtime.effect(move || {
            reader.get("age", |p| p.age);
        });
        assert_eq!(runtime.stats().targets, 1);

        effect.stop();
        // The effect body holds a handle too.
        drop(effect);
        drop(user);
        assert_eq!(runtime.stats().targets, 0);
        assert_eq!(runtime.stats().cached_wrappers, 0);
    }
}
