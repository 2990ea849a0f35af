//! Effect Implementation
//!
//! An Effect is a side-effecting computation that re-runs whenever the
//! reactive state it read during its last run changes.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately (unless lazy)
//!    to establish its initial dependencies.
//!
//! 2. Every run marks the effect clean, bumps its generation and re-tracks
//!    its dependencies from scratch. Deps the run did not reach are dropped,
//!    so a branch that stops reading some state stops depending on it.
//!
//! 3. When a dependency changes, the effect is marked dirty and its
//!    scheduling policy decides what happens next: re-run inline, queue a
//!    job, queue a post-flush job or call a custom scheduler.
//!
//! # Recursion
//!
//! An effect that writes state it also reads would trigger itself. While an
//! effect is running, triggers only mark it dirty; its scheduler is not
//! invoked unless the effect opts in with `allow_recurse`.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::graph::{DirtyLevel, EffectFn, EffectId, EffectNode, Job, StopHook};

use super::runtime::Runtime;

/// A custom scheduler. It receives the effect whose dependencies changed.
pub type SchedulerFn = Arc<dyn Fn(&Effect) + Send + Sync>;

/// How the graph notifies an effect once it is dirty.
#[derive(Clone)]
pub(crate) enum Scheduling {
    /// Re-run right away if still dirty.
    Inline,
    /// Hand the effect to a scheduler.
    Custom(SchedulerFn),
}

#[derive(Clone, Default)]
enum Policy {
    #[default]
    Inline,
    Queued(u64),
    Post,
    Custom(SchedulerFn),
}

/// Options for [`Runtime::effect_with`].
#[derive(Default)]
pub struct EffectOptions {
    lazy: bool,
    label: Option<String>,
    allow_recurse: bool,
    on_stop: Option<StopHook>,
    policy: Policy,
}

impl EffectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Do not run the effect on creation.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Let the effect be scheduled while it is running.
    pub fn allow_recurse(mut self) -> Self {
        self.allow_recurse = true;
        self
    }

    /// Run `hook` once when the effect stops.
    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_stop = Some(Box::new(hook));
        self
    }

    /// Re-run through a job with priority `id` in the next flush.
    pub fn queued(mut self, id: u64) -> Self {
        self.policy = Policy::Queued(id);
        self
    }

    /// Re-run through a job in the post phase of the next flush.
    pub fn post(mut self) -> Self {
        self.policy = Policy::Post;
        self
    }

    /// Hand the effect to `scheduler` instead of re-running it.
    pub fn scheduler<F>(mut self, scheduler: F) -> Self
    where
        F: Fn(&Effect) + Send + Sync + 'static,
    {
        self.policy = Policy::Custom(Arc::new(scheduler));
        self
    }
}

/// Build the scheduler that pushes one shared job for the effect.
///
/// The job is created on first use and reused afterwards, which is what lets
/// the queue deduplicate repeated triggers.
fn job_scheduler(id: Option<u64>, post: bool) -> SchedulerFn {
    let slot: OnceLock<Job> = OnceLock::new();
    Arc::new(move |effect: &Effect| {
        let job = slot
            .get_or_init(|| {
                let mut job = Job::from_effect(effect.clone());
                if let Some(id) = id {
                    job = job.with_id(id);
                }
                if effect.allows_recurse() {
                    job = job.allow_recurse();
                }
                job
            })
            .clone();

        if post {
            effect.runtime().queue_post_flush(job);
        } else {
            effect.runtime().queue_job(job);
        }
    })
}

/// Handle to an effect registered with a runtime.
///
/// Clones refer to the same effect. Dropping a handle does not stop the
/// effect; call [`Effect::stop`].
#[derive(Clone)]
pub struct Effect {
    runtime: Runtime,
    id: EffectId,
    label: Arc<str>,
    body: Option<EffectFn>,
    allow_recurse: bool,
}

impl Effect {
    /// Build a handle for a node read under the graph lock.
    pub(crate) fn from_node(runtime: Runtime, id: EffectId, node: &EffectNode) -> Self {
        Self {
            runtime,
            id,
            label: node.label.clone(),
            body: node.body.clone(),
            allow_recurse: node.allow_recurse,
        }
    }

    pub fn id(&self) -> EffectId {
        self.id
    }

    pub fn label(&self) -> Arc<str> {
        Arc::clone(&self.label)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn allows_recurse(&self) -> bool {
        self.allow_recurse
    }

    /// Run the effect, re-tracking its dependencies.
    ///
    /// A stopped effect still calls its function, but nothing is tracked.
    pub fn run(&self) {
        let Some(body) = &self.body else {
            return;
        };
        self.runtime.run_tracked(self.id, || body());
    }

    /// Unsubscribe the effect from every dep. Calling it again does nothing.
    pub fn stop(&self) {
        self.runtime.stop_effect(self.id);
    }

    /// Whether the effect has not been stopped.
    pub fn is_active(&self) -> bool {
        self.runtime.effect_exists(self.id)
    }

    /// Whether the effect must re-run.
    ///
    /// A maybe-dirty effect is resolved by refreshing the computed values it
    /// read, in order, until one of them turns out to have changed.
    pub fn is_dirty(&self) -> bool {
        self.runtime.effect_dirty(self.id)
    }

    /// The raw dirtiness level, `None` once stopped.
    pub fn dirty_level(&self) -> Option<DirtyLevel> {
        self.runtime.dirty_level(self.id)
    }
}

impl PartialEq for Effect {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.runtime == other.runtime
    }
}

impl Eq for Effect {}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Runtime {
    /// Create an effect that runs now and re-runs inline when dirty.
    pub fn effect<F>(&self, f: F) -> Effect
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.effect_with(f, EffectOptions::default())
    }

    /// Create an effect with explicit options.
    pub fn effect_with<F>(&self, f: F, options: EffectOptions) -> Effect
    where
        F: Fn() + Send + Sync + 'static,
    {
        let EffectOptions {
            lazy,
            label,
            allow_recurse,
            on_stop,
            policy,
        } = options;

        let label: Arc<str> = Arc::from(label.as_deref().unwrap_or("effect"));
        let body: EffectFn = Arc::new(f);
        let scheduling = match policy {
            Policy::Inline => Scheduling::Inline,
            Policy::Queued(id) => Scheduling::Custom(job_scheduler(Some(id), false)),
            Policy::Post => Scheduling::Custom(job_scheduler(None, true)),
            Policy::Custom(scheduler) => Scheduling::Custom(scheduler),
        };

        let mut node = EffectNode::effect(label.clone(), body.clone(), scheduling);
        node.allow_recurse = allow_recurse;
        node.on_stop = on_stop;
        let id = self.graph().insert_effect(node);

        let effect = Effect {
            runtime: self.clone(),
            id,
            label,
            body: Some(body),
            allow_recurse,
        };
        tracing::debug!(runtime = %self.label(), effect = %effect.label, lazy, "effect created");

        if !lazy {
            effect.run();
        }
        effect
    }
}

// ---- Tests ----
