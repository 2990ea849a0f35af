//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects containers, computed
//! values, effects and watchers. It owns the dependency graph, the job queue,
//! the wrapper identity cache and the error handler.
//!
//! # How It Works
//!
//! 1. When a container is read inside a running effect, the runtime records
//!    the dependency (`track`).
//!
//! 2. When a container is written, the runtime:
//!    a. Finds the deps the write affects
//!    b. Raises the dirtiness of their subscribers
//!    c. Collects the subscribers that have a scheduler
//!    d. Invokes those schedulers once the graph is unlocked and no batch is
//!       open
//!
//! 3. Schedulers usually push a job onto the queue. Jobs run when the flush
//!    driver calls [`Runtime::flush`], either directly, through
//!    [`Runtime::next_tick`] or through [`Runtime::run_flush_loop`].
//!
//! # Thread Safety
//!
//! The graph and queue sit behind `parking_lot` mutexes that are never held
//! while user code runs. The tracking context is thread-local, so an effect
//! only tracks reads made on the thread that runs it.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::RuntimeConfig;
use crate::error::{ErrorHandler, ErrorPhase, ReactiveError};
use crate::graph::{
    ComputedSource, ContainerId, DirtyLevel, DirtyQuery, EffectId, Graph, Job, JobQueue, Key,
    TargetKind, TrackOp, TriggerOp,
};

use super::context::ReactiveContext;
use super::effect::{Effect, Scheduling};

/// Unique identifier for a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeId(u64);

impl RuntimeId {
    /// Generate a new unique runtime ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RuntimeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Key of the wrapper identity cache: address of the underlying value, the
/// container shape and whether the wrapper is shallow.
pub(crate) type CacheKey = (usize, TargetKind, bool);

/// Counts describing the state of a runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Live effects, including the effects behind computed values.
    pub effects: usize,
    /// Live deps.
    pub deps: usize,
    /// Containers with at least one dep.
    pub targets: usize,
    /// Jobs waiting in the main list.
    pub queued: usize,
    /// Jobs waiting in the post list.
    pub post_queued: usize,
    /// Entries in the wrapper identity cache.
    pub cached_wrappers: usize,
}

pub(crate) struct RuntimeInner {
    id: RuntimeId,
    config: RuntimeConfig,
    graph: Mutex<Graph>,
    queue: Mutex<JobQueue>,
    pub(crate) wrappers: DashMap<CacheKey, Weak<dyn Any + Send + Sync>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    flush_requested: Notify,
    settled: Notify,
}

/// Handle to a reactive runtime.
///
/// Cloning is cheap and every clone refers to the same runtime. Effects keep
/// their runtime alive until they are stopped or the runtime is disposed.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        tracing::debug!(runtime = %config.label, "runtime created");
        Self {
            inner: Arc::new(RuntimeInner {
                id: RuntimeId::new(),
                config,
                graph: Mutex::new(Graph::new()),
                queue: Mutex::new(JobQueue::new()),
                wrappers: DashMap::new(),
                error_handler: RwLock::new(None),
                flush_requested: Notify::new(),
                settled: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> RuntimeId {
        self.inner.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub(crate) fn label(&self) -> &str {
        &self.inner.config.label
    }

    pub(crate) fn graph(&self) -> MutexGuard<'_, Graph> {
        self.inner.graph.lock()
    }

    pub(crate) fn wrappers(&self) -> &DashMap<CacheKey, Weak<dyn Any + Send + Sync>> {
        &self.inner.wrappers
    }

    // ---- Tracking ----

    /// Record that the running effect read `key` of `target`.
    ///
    /// Does nothing when no effect of this runtime is running or tracking is
    /// paused.
    pub fn track(&self, target: ContainerId, op: TrackOp, key: Key) {
        let Some(effect) = ReactiveContext::active_effect(self.id()) else {
            return;
        };

        let mut graph = self.graph();
        if !graph.effects.contains_key(effect) {
            return;
        }
        let dep = graph.target_dep(target, key);
        if graph.track_effect(effect, dep) {
            tracing::trace!(
                runtime = %self.label(),
                target = target.raw(),
                ?key,
                ?op,
                "track"
            );
        }
    }

    /// Notify the subscribers of the locations a write affected.
    ///
    /// Schedulers run before this returns unless a batch is open.
    pub fn trigger(&self, target: ContainerId, kind: TargetKind, op: TriggerOp, key: Option<Key>) {
        let hit = self.graph().trigger_target(target, kind, op, key);
        if hit > 0 {
            tracing::trace!(
                runtime = %self.label(),
                target = target.raw(),
                ?key,
                ?op,
                deps = hit,
                "trigger"
            );
        }
        self.run_pending_schedulers();
    }

    /// Run `f` without tracking any reads.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _paused = ReactiveContext::pause();
        f()
    }

    /// Pause tracking until the returned guard is dropped.
    pub fn pause_tracking(&self) -> ReactiveContext {
        ReactiveContext::pause()
    }

    /// Run `f` with scheduler invocation deferred until it returns.
    ///
    /// Batches nest; schedulers run when the outermost batch closes.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.graph().schedule_depth += 1;
        let _batch = BatchGuard { runtime: self };
        f()
    }

    /// Invoke the schedulers of effects triggered while the graph was locked.
    pub(crate) fn run_pending_schedulers(&self) {
        loop {
            let next = {
                let mut graph = self.graph();
                if graph.schedule_depth > 0 {
                    return;
                }
                let Some(id) = graph.pending.pop_front() else {
                    return;
                };
                graph.effects.get(id).and_then(|node| {
                    let scheduling = node.scheduling.clone()?;
                    let handle = Effect::from_node(self.clone(), id, node);
                    Some((handle, scheduling))
                })
            };

            match next {
                Some((effect, Scheduling::Inline)) => {
                    self.guarded(&effect.label(), ErrorPhase::Effect, || {
                        if effect.is_dirty() {
                            effect.run();
                        }
                    });
                }
                Some((effect, Scheduling::Custom(scheduler))) => {
                    self.guarded(&effect.label(), ErrorPhase::Effect, || scheduler(&effect));
                }
                None => {}
            }
        }
    }

    // ---- Effect machinery ----

    /// Run `f` as a tracked run of effect `id`.
    ///
    /// If the effect no longer exists, `f` runs untracked.
    pub(crate) fn run_tracked<R>(&self, id: EffectId, f: impl FnOnce() -> R) -> R {
        let started = match self.graph().effects.get_mut(id) {
            Some(node) => {
                node.begin_run();
                true
            }
            None => false,
        };
        if !started {
            let _paused = ReactiveContext::pause();
            return f();
        }

        let _run = RunGuard { runtime: self, effect: id };
        let _ctx = ReactiveContext::enter(self.id(), id);
        f()
    }

    /// Resolve whether effect `id` must re-run, refreshing computed deps
    /// when its state is only maybe-dirty.
    pub(crate) fn effect_dirty(&self, id: EffectId) -> bool {
        let query = self.graph().begin_dirty_query(id);
        match query {
            DirtyQuery::Resolved(dirty) => dirty,
            DirtyQuery::Refresh(sources) => {
                {
                    let _paused = ReactiveContext::pause();
                    for source in sources {
                        source.refresh();
                        let level = self.graph().dirty_level(id);
                        if level.map_or(true, |level| level >= DirtyLevel::Dirty) {
                            break;
                        }
                    }
                }
                self.graph().finish_dirty_query(id)
            }
        }
    }

    pub(crate) fn dirty_level(&self, id: EffectId) -> Option<DirtyLevel> {
        self.graph().dirty_level(id)
    }

    pub(crate) fn effect_exists(&self, id: EffectId) -> bool {
        self.graph().effects.contains_key(id)
    }

    /// Remove effect `id` from the graph and run its stop hook.
    ///
    /// Returns `false` if the effect was already stopped.
    pub(crate) fn stop_effect(&self, id: EffectId) -> bool {
        let removed = self.graph().remove_effect(id);
        let Some(mut node) = removed else {
            return false;
        };

        tracing::debug!(runtime = %self.label(), effect = %node.label, "effect stopped");
        if let Some(on_stop) = node.on_stop.take() {
            on_stop();
        }
        true
    }

    /// Track the running effect against the value of a computed.
    pub(crate) fn track_computed(&self, node: EffectId, source: Weak<dyn ComputedSource>) {
        let Some(effect) = ReactiveContext::active_effect(self.id()) else {
            return;
        };

        let mut graph = self.graph();
        if !graph.effects.contains_key(effect) {
            return;
        }
        if let Some(dep) = graph.computed_dep(node, source) {
            graph.track_effect(effect, dep);
        }
    }

    /// Notify the consumers of a computed value.
    pub(crate) fn trigger_computed(&self, node: EffectId, level: DirtyLevel) {
        {
            let mut graph = self.graph();
            let own = graph.effects.get(node).and_then(|computed| computed.own_dep);
            if let Some(dep) = own {
                graph.trigger_dep(dep, level);
            }
        }
        self.run_pending_schedulers();
    }

    // ---- Job queue ----

    /// Queue a job for the main phase of the next flush.
    ///
    /// A job that is already pending is not queued twice.
    pub fn queue_job(&self, job: Job) {
        let request = self.inner.queue.lock().queue_job(job);
        if request {
            self.request_flush();
        }
    }

    /// Queue a job for the post phase of the next flush.
    pub fn queue_post_flush(&self, job: Job) {
        let request = self.inner.queue.lock().queue_post(job);
        if request {
            self.request_flush();
        }
    }

    /// Remove a pending job that has not started yet.
    pub fn invalidate_job(&self, job: &Job) -> bool {
        self.inner.queue.lock().invalidate_job(job)
    }

    fn request_flush(&self) {
        tracing::trace!(runtime = %self.label(), "flush requested");
        self.inner.flush_requested.notify_one();
    }

    /// Drain the queue: every pending job, then every post job, repeated
    /// until both lists stay empty.
    ///
    /// Does nothing when called from inside a running flush.
    pub fn flush(&self) {
        if !self.inner.queue.lock().begin_flush() {
            return;
        }
        let guard = FlushGuard { runtime: self };

        let mut rounds = 0usize;
        loop {
            rounds += 1;
            let mut ran = 0usize;

            while let Some(job) = self.current_job() {
                if job.is_active() {
                    self.run_job(&job, ErrorPhase::Scheduler);
                    ran += 1;
                }
                self.inner.queue.lock().advance();
            }
            let finished = self.inner.queue.lock().end_main_pass();
            drop(finished);

            let post = self.inner.queue.lock().begin_post_pass();
            if post {
                while let Some(job) = self.current_post_job() {
                    if job.is_active() {
                        self.run_job(&job, ErrorPhase::PostFlush);
                        ran += 1;
                    }
                    self.inner.queue.lock().advance_post();
                }
                let finished = self.inner.queue.lock().end_post_pass();
                drop(finished);
            }

            tracing::debug!(runtime = %self.label(), round = rounds, jobs = ran, "flush round");
            if !self.inner.queue.lock().finish_round() {
                break;
            }
        }

        std::mem::forget(guard);
        self.inner.settled.notify_waiters();
    }

    fn current_job(&self) -> Option<Job> {
        self.inner.queue.lock().current_job()
    }

    fn current_post_job(&self) -> Option<Job> {
        self.inner.queue.lock().current_post_job()
    }

    /// Run pending `pre` jobs ahead of the rest of the queue.
    pub fn flush_pre_jobs(&self) {
        let mut cursor = self.inner.queue.lock().pre_pass_start();
        loop {
            let next = self.inner.queue.lock().take_pre_job(&mut cursor);
            let Some(job) = next else {
                break;
            };
            if job.is_active() {
                self.run_job(&job, ErrorPhase::Scheduler);
            }
        }
    }

    fn run_job(&self, job: &Job, phase: ErrorPhase) {
        self.guarded(&job.label(), phase, || job.run());
    }

    /// Run user code inside a panic boundary.
    ///
    /// A panic is reported to the error handler and `None` is returned. With
    /// `catch_panics` disabled the panic propagates.
    pub(crate) fn guarded<R>(&self, owner: &str, phase: ErrorPhase, f: impl FnOnce() -> R) -> Option<R> {
        if !self.inner.config.catch_panics {
            return Some(f());
        }
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                self.report_error(ReactiveError::from_panic(owner, phase, payload));
                None
            }
        }
    }

    /// Wait until the queue has fully drained.
    ///
    /// Yields to the executor first, then flushes if nobody else is, then
    /// waits for a flush running elsewhere to settle.
    pub async fn next_tick(&self) {
        tokio::task::yield_now().await;

        loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let (busy, flushing) = {
                let queue = self.inner.queue.lock();
                (queue.is_busy(), queue.is_flushing())
            };
            if !busy {
                return;
            }
            if !flushing {
                self.flush();
                continue;
            }
            settled.await;
        }
    }

    /// Flush every time a flush is requested. Never returns.
    ///
    /// Spawn it on a current-thread runtime or a `LocalSet` next to the code
    /// that mutates state.
    pub async fn run_flush_loop(&self) {
        loop {
            self.inner.flush_requested.notified().await;
            self.flush();
        }
    }

    // ---- Errors ----

    /// Install the handler receiving panics caught at effect, job and watcher
    /// boundaries.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&ReactiveError) + Send + Sync + 'static,
    {
        *self.inner.error_handler.write() = Some(Arc::new(handler));
    }

    pub(crate) fn report_error(&self, error: ReactiveError) {
        let handler = self.inner.error_handler.read().clone();
        match handler {
            Some(handler) => handler(&error),
            None => tracing::error!(runtime = %self.label(), %error, "unhandled reactive error"),
        }
    }

    // ---- Lifecycle ----

    pub fn stats(&self) -> RuntimeStats {
        let (effects, deps, targets) = {
            let graph = self.graph();
            (graph.effects.len(), graph.deps.len(), graph.target_count())
        };
        let (queued, post_queued) = {
            let queue = self.inner.queue.lock();
            (queue.queued_len(), queue.post_len())
        };
        RuntimeStats {
            effects,
            deps,
            targets,
            queued,
            post_queued,
            cached_wrappers: self.inner.wrappers.len(),
        }
    }

    /// Stop every effect, drop every queued job and clear the wrapper cache.
    ///
    /// Handles stay usable afterwards: reads return current values and writes
    /// apply, but nothing is tracked until new effects are created.
    pub fn dispose(&self) {
        let nodes = self.graph().clear();
        let jobs = self.inner.queue.lock().clear();
        self.inner.wrappers.clear();

        tracing::debug!(
            runtime = %self.label(),
            effects = nodes.len(),
            jobs = jobs.len(),
            "runtime disposed"
        );
        for mut node in nodes {
            if let Some(on_stop) = node.on_stop.take() {
                on_stop();
            }
        }
        drop(jobs);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Runtime {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Runtime {}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("label", &self.inner.config.label)
            .finish()
    }
}

/// Finishes an effect run: prunes deps the run did not reach and releases
/// the recursion guard.
struct RunGuard<'a> {
    runtime: &'a Runtime,
    effect: EffectId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut graph = self.runtime.graph();
        graph.post_cleanup(self.effect);
        if let Some(node) = graph.effects.get_mut(self.effect) {
            node.runnings = node.runnings.saturating_sub(1);
        }
    }
}

struct BatchGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        {
            let mut graph = self.runtime.graph();
            graph.schedule_depth = graph.schedule_depth.saturating_sub(1);
        }
        if !std::thread::panicking() {
            self.runtime.run_pending_schedulers();
        }
    }
}

/// Resets the queue when a job unwinds through the flush.
struct FlushGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        let jobs = self.runtime.inner.queue.lock().abort_flush();
        drop(jobs);
        self.runtime.inner.settled.notify_waiters();
    }
}

// ---- Tests ----
