//! Watch Implementation
//!
//! A watcher runs a callback when a source value changes. It sits on top of
//! an effect: the effect tracks what the source reads, and its scheduler
//! queues a job that re-reads the source, compares it with the previous
//! value and calls the callback with both.
//!
//! # Sources
//!
//! Anything implementing [`WatchSource`] can be watched:
//!
//! - Closures returning a comparable value (`move || user.get("age", |u| u.age)`)
//! - [`Ref`] and [`Computed`] handles, compared by value
//! - [`Reactive`], [`ReactiveVec`] and [`ReactiveMap`] handles, which are
//!   watched deeply and fire on any nested write
//! - [`Many`], a list of sources that fires when any of them changes
//!
//! # Timing
//!
//! [`FlushMode::Sync`] runs the job as soon as the write that triggered it
//! returns. `Pre` and `Post` queue it for the main or post phase of the next
//! flush, so several writes in a row produce one callback.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{Depth, FlushMode};
use crate::error::ErrorPhase;
use crate::graph::{EffectFn, EffectId, EffectNode, Job};

use super::cell::Ref;
use super::collections::{ReactiveMap, ReactiveVec};
use super::computed::Computed;
use super::container::Reactive;
use super::effect::{Effect, Scheduling};
use super::runtime::Runtime;
use super::traverse::{Traversal, Traverse};

/// Something a watcher can read and compare.
pub trait WatchSource: Send + Sync + 'static {
    type Value: Clone + Traverse + Send + Sync + 'static;

    /// Read the current value. Reads are tracked by the watcher.
    fn read(&self) -> Self::Value;

    /// Whether the callback should fire for this pair of values.
    fn has_changed(&self, new: &Self::Value, old: &Self::Value) -> bool;

    /// Depth the watcher traverses when the options do not set one.
    fn implicit_depth(&self) -> Option<Depth> {
        None
    }

    /// Fire on every trigger, even when `has_changed` says no.
    fn forces_trigger(&self) -> bool {
        self.implicit_depth().is_some()
    }
}

impl<F, T> WatchSource for F
where
    F: Fn() -> T + Send + Sync + 'static,
    T: Clone + PartialEq + Traverse + Send + Sync + 'static,
{
    type Value = T;

    fn read(&self) -> T {
        self()
    }

    fn has_changed(&self, new: &T, old: &T) -> bool {
        new != old
    }
}

impl<T> WatchSource for Ref<T>
where
    T: Clone + PartialEq + Traverse + Send + Sync + 'static,
{
    type Value = T;

    fn read(&self) -> T {
        self.get()
    }

    fn has_changed(&self, new: &T, old: &T) -> bool {
        new != old
    }
}

impl<T> WatchSource for Computed<T>
where
    T: Clone + PartialEq + Traverse + Send + Sync + 'static,
{
    type Value = T;

    fn read(&self) -> T {
        self.get()
    }

    fn has_changed(&self, new: &T, old: &T) -> bool {
        new != old
    }
}

impl<T> WatchSource for Reactive<T>
where
    T: Traverse + Send + Sync + 'static,
{
    type Value = Reactive<T>;

    fn read(&self) -> Reactive<T> {
        self.clone()
    }

    fn has_changed(&self, new: &Reactive<T>, old: &Reactive<T>) -> bool {
        new != old
    }

    fn implicit_depth(&self) -> Option<Depth> {
        if self.is_shallow() {
            Some(Depth::Shallow)
        } else {
            Some(Depth::Unlimited)
        }
    }
}

impl<T> WatchSource for ReactiveVec<T>
where
    T: Clone + PartialEq + Traverse + Send + Sync + 'static,
{
    type Value = ReactiveVec<T>;

    fn read(&self) -> ReactiveVec<T> {
        self.clone()
    }

    fn has_changed(&self, new: &ReactiveVec<T>, old: &ReactiveVec<T>) -> bool {
        new != old
    }

    fn implicit_depth(&self) -> Option<Depth> {
        Some(Depth::Unlimited)
    }
}

impl<K, V> WatchSource for ReactiveMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Traverse + Send + Sync + 'static,
{
    type Value = ReactiveMap<K, V>;

    fn read(&self) -> ReactiveMap<K, V> {
        self.clone()
    }

    fn has_changed(&self, new: &ReactiveMap<K, V>, old: &ReactiveMap<K, V>) -> bool {
        new != old
    }

    fn implicit_depth(&self) -> Option<Depth> {
        Some(Depth::Unlimited)
    }
}

/// Several sources watched together.
///
/// The callback receives every value in order and fires when any of them
/// changed. Container sources inside are traversed at their own implicit
/// depth.
pub struct Many<S>(pub Vec<S>);

impl<S: WatchSource> WatchSource for Many<S> {
    type Value = Vec<S::Value>;

    fn read(&self) -> Vec<S::Value> {
        self.0
            .iter()
            .map(|source| {
                let value = source.read();
                if let Some(depth) = source.implicit_depth() {
                    value.traverse(&mut Traversal::new(depth.levels()));
                }
                value
            })
            .collect()
    }

    fn has_changed(&self, new: &Vec<S::Value>, old: &Vec<S::Value>) -> bool {
        new.len() != old.len()
            || self
                .0
                .iter()
                .zip(new.iter().zip(old.iter()))
                .any(|(source, (new, old))| source.has_changed(new, old))
    }

    fn forces_trigger(&self) -> bool {
        self.0.iter().any(|source| source.forces_trigger())
    }
}

/// Options for [`Runtime::watch`].
///
/// Deserializes from the same JSON vocabulary as the runtime config:
///
/// ```json
/// { "immediate": true, "deep": { "bounded": 2 }, "flush": "post" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// Call the callback right away with no previous value.
    pub immediate: bool,
    /// Traverse the value this deep and fire on every trigger.
    pub deep: Option<Depth>,
    /// Callback timing. Falls back to the runtime's `default_flush`.
    pub flush: Option<FlushMode>,
    /// Stop after the first callback.
    pub once: bool,
    /// Priority id of the watcher's job.
    pub id: Option<u64>,
    pub label: Option<String>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn deep(mut self, depth: Depth) -> Self {
        self.deep = Some(depth);
        self
    }

    pub fn flush(mut self, flush: FlushMode) -> Self {
        self.flush = Some(flush);
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Registers cleanup work for a watcher.
///
/// The registered function runs before the next callback and when the
/// watcher stops. Registering again replaces the previous function.
#[derive(Clone, Default)]
pub struct OnCleanup {
    slot: Arc<Mutex<Option<Cleanup>>>,
}

impl OnCleanup {
    pub fn register<F>(&mut self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.slot.lock() = Some(Box::new(cleanup));
    }

    fn run(&self, runtime: &Runtime, owner: &str) {
        let pending = self.slot.lock().take();
        if let Some(cleanup) = pending {
            runtime.guarded(owner, ErrorPhase::WatchCleanup, cleanup);
        }
    }
}

impl fmt::Debug for OnCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnCleanup")
            .field("pending", &self.slot.lock().is_some())
            .finish()
    }
}

type Callback<V> = Box<dyn Fn(&V, Option<&V>, &mut OnCleanup) + Send + Sync>;

struct Watcher<S: WatchSource> {
    runtime: Runtime,
    label: Arc<str>,
    source: S,
    callback: Callback<S::Value>,
    depth: Option<Depth>,
    forced: bool,
    once: bool,
    flush: FlushMode,
    effect: OnceLock<EffectId>,
    job: OnceLock<Job>,
    old: Mutex<Option<S::Value>>,
    cleanup: OnCleanup,
    running: AtomicBool,
    rerun: AtomicBool,
}

impl<S: WatchSource> Watcher<S> {
    /// Read the source, traversing it when the watcher is deep.
    fn collect(&self) -> S::Value {
        let value = self.source.read();
        if let Some(depth) = self.depth {
            value.traverse(&mut Traversal::new(depth.levels()));
        }
        value
    }

    /// Read the source as a tracked run of the watcher's effect.
    fn read_tracked(&self, effect: EffectId) -> Option<S::Value> {
        self.runtime.guarded(&self.label, ErrorPhase::WatchGetter, || {
            self.runtime.run_tracked(effect, || self.collect())
        })
    }

    fn schedule(&self) {
        let Some(job) = self.job.get() else {
            return;
        };
        match self.flush {
            FlushMode::Sync => self.run_job(),
            FlushMode::Pre => self.runtime.queue_job(job.clone()),
            FlushMode::Post => self.runtime.queue_post_flush(job.clone()),
        }
    }

    /// Run the watcher. A trigger raised by the callback itself is handled
    /// after the callback returns instead of re-entering it.
    fn run_job(&self) {
        let Some(&effect) = self.effect.get() else {
            return;
        };
        if self.running.swap(true, Ordering::SeqCst) {
            self.rerun.store(true, Ordering::SeqCst);
            return;
        }
        let _running = Running(&self.running);

        loop {
            self.rerun.store(false, Ordering::SeqCst);
            if !self.runtime.effect_exists(effect) {
                break;
            }
            self.step(effect);
            if !self.rerun.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    fn step(&self, effect: EffectId) {
        if !self.runtime.effect_dirty(effect) {
            return;
        }
        let Some(new) = self.read_tracked(effect) else {
            return;
        };

        let old = self.old.lock().take();
        let changed = match &old {
            None => true,
            Some(old) => self.forced || self.source.has_changed(&new, old),
        };
        if !changed {
            *self.old.lock() = old;
            return;
        }

        self.cleanup.run(&self.runtime, &self.label);
        tracing::trace!(watcher = %self.label, "watch callback");
        let mut on_cleanup = self.cleanup.clone();
        self.runtime.guarded(&self.label, ErrorPhase::WatchCallback, || {
            (self.callback)(&new, old.as_ref(), &mut on_cleanup)
        });
        *self.old.lock() = Some(new);

        if self.once {
            self.stop(effect);
        }
    }

    fn stop(&self, effect: EffectId) {
        if let Some(job) = self.job.get() {
            job.dispose();
        }
        self.runtime.stop_effect(effect);
    }
}

/// Clears a watcher's running flag, also when the callback unwinds.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle returned by [`Runtime::watch`] and [`Runtime::watch_effect`].
///
/// Dropping the handle does not stop the watcher.
#[derive(Clone)]
pub struct WatchHandle {
    runtime: Runtime,
    effect: EffectId,
    job: Option<Job>,
}

impl WatchHandle {
    /// Stop the watcher and run its pending cleanup. Calling it again does
    /// nothing.
    pub fn stop(&self) {
        if let Some(job) = &self.job {
            job.dispose();
        }
        self.runtime.stop_effect(self.effect);
    }

    pub fn is_active(&self) -> bool {
        self.runtime.effect_exists(self.effect)
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("effect", &self.effect)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Runtime {
    /// Call `callback` with the new and previous value whenever `source`
    /// changes.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let count = runtime.create_ref(0);
    /// let handle = runtime.watch(count.clone(), |new, old, _| {
    ///     println!("{old:?} -> {new}");
    /// }, WatchOptions::new());
    ///
    /// count.set(1);
    /// runtime.flush(); // prints "Some(0) -> 1"
    /// ```
    pub fn watch<S, F>(&self, source: S, callback: F, options: WatchOptions) -> WatchHandle
    where
        S: WatchSource,
        F: Fn(&S::Value, Option<&S::Value>, &mut OnCleanup) + Send + Sync + 'static,
    {
        let WatchOptions {
            immediate,
            deep,
            flush,
            once,
            id,
            label,
        } = options;

        let label: Arc<str> = Arc::from(label.as_deref().unwrap_or("watcher"));
        let flush = flush.unwrap_or(self.config().default_flush);
        let depth = deep.or_else(|| source.implicit_depth());
        let forced = deep.is_some() || source.forces_trigger();

        let watcher = Arc::new(Watcher {
            runtime: self.clone(),
            label: label.clone(),
            source,
            callback: Box::new(callback),
            depth,
            forced,
            once,
            flush,
            effect: OnceLock::new(),
            job: OnceLock::new(),
            old: Mutex::new(None),
            cleanup: OnCleanup::default(),
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&watcher);
        let mut job = Job::new(move || {
            if let Some(watcher) = weak.upgrade() {
                watcher.run_job();
            }
        })
        .labeled(label.clone())
        .allow_recurse();
        if let Some(id) = id {
            job = job.with_id(id);
        }
        if flush == FlushMode::Pre {
            job = job.pre();
        }
        let _ = watcher.job.set(job.clone());

        let body: EffectFn = {
            let watcher = Arc::downgrade(&watcher);
            Arc::new(move || {
                if let Some(watcher) = watcher.upgrade() {
                    watcher.collect();
                }
            })
        };
        let scheduler = {
            let watcher = watcher.clone();
            Scheduling::Custom(Arc::new(move |_: &Effect| watcher.schedule()))
        };
        let mut node = EffectNode::effect(label.clone(), body, scheduler);
        node.on_stop = Some(stop_hook(self.clone(), label.clone(), watcher.cleanup.clone()));
        let effect = self.graph().insert_effect(node);
        let _ = watcher.effect.set(effect);

        tracing::debug!(runtime = %self.label(), watcher = %label, ?flush, immediate, "watcher created");

        if immediate {
            watcher.run_job();
        } else {
            let initial = watcher.read_tracked(effect);
            *watcher.old.lock() = initial;
        }

        WatchHandle {
            runtime: self.clone(),
            effect,
            job: Some(job),
        }
    }

    /// Run `f` now and again whenever what it read changes.
    ///
    /// `f` receives an [`OnCleanup`] whose function runs before the next run
    /// and when the watcher stops. With [`FlushMode::Post`] the first run is
    /// deferred to the next flush as well.
    pub fn watch_effect<F>(&self, f: F, flush: FlushMode) -> WatchHandle
    where
        F: Fn(&mut OnCleanup) + Send + Sync + 'static,
    {
        let label: Arc<str> = Arc::from("watch_effect");
        let cleanup = OnCleanup::default();

        let body: EffectFn = {
            let runtime = self.clone();
            let label = label.clone();
            let cleanup = cleanup.clone();
            Arc::new(move || {
                runtime.untracked(|| cleanup.run(&runtime, &label));
                let mut on_cleanup = cleanup.clone();
                runtime.guarded(&label, ErrorPhase::WatchCallback, || f(&mut on_cleanup));
            })
        };
        let scheduling = match flush {
            FlushMode::Sync => Scheduling::Inline,
            FlushMode::Pre => Scheduling::Custom(effect_job_scheduler(true)),
            FlushMode::Post => Scheduling::Custom(effect_job_scheduler(false)),
        };

        let mut node = EffectNode::effect(label.clone(), body, scheduling);
        node.on_stop = Some(stop_hook(self.clone(), label.clone(), cleanup));
        let id = self.graph().insert_effect(node);
        let effect = {
            let graph = self.graph();
            graph
                .effects
                .get(id)
                .map(|node| Effect::from_node(self.clone(), id, node))
        };

        tracing::debug!(runtime = %self.label(), ?flush, "watch effect created");

        if let Some(effect) = effect {
            match flush {
                FlushMode::Post => self.queue_post_flush(Job::from_effect(effect)),
                FlushMode::Sync | FlushMode::Pre => effect.run(),
            }
        }

        WatchHandle {
            runtime: self.clone(),
            effect: id,
            job: None,
        }
    }
}

/// Scheduler that re-runs a watch effect through one shared job.
fn effect_job_scheduler(pre: bool) -> Arc<dyn Fn(&Effect) + Send + Sync> {
    let slot: OnceLock<Job> = OnceLock::new();
    Arc::new(move |effect: &Effect| {
        let job = slot
            .get_or_init(|| {
                let job = Job::from_effect(effect.clone());
                if pre {
                    job.pre()
                } else {
                    job
                }
            })
            .clone();
        if pre {
            effect.runtime().queue_job(job);
        } else {
            effect.runtime().queue_post_flush(job);
        }
    })
}

fn stop_hook(runtime: Runtime, label: Arc<str>, cleanup: OnCleanup) -> Box<dyn FnOnce() + Send> {
    Box::new(move || cleanup.run(&runtime, &label))
}

// ---- Tests ----
