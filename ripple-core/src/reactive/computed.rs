//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when it is
//! read after one of its dependencies changed.
//!
//! # How Computed Values Work
//!
//! 1. The getter runs inside an effect node of its own, so it tracks its
//!    dependencies like any effect. The node has no scheduler: when a
//!    dependency changes, the node is marked dirty and its consumers are
//!    marked maybe-dirty.
//!
//! 2. On read, a dirty value is recomputed. If the result differs from the
//!    cache, consumers are marked dirty.
//!
//! 3. A maybe-dirty consumer resolves its state by reading the computed
//!    values it depends on. If none of them changed, it stays clean and does
//!    not re-run.
//!
//! 4. Values that are never read stay dirty. Nothing is recomputed eagerly.
//!
//! # Side Effects in Getters
//!
//! A getter that writes one of its own dependencies leaves the node dirty
//! after it runs. Consumers are then told the value is still settling
//! (`MaybeDirtyComputedSideEffect`), which resolves on their next read
//! without scheduling them from inside the getter.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::{ReactiveError, Result};
use crate::graph::{ComputedSource, DirtyLevel, EffectId, EffectNode};

use super::runtime::Runtime;

type Getter<T> = Box<dyn Fn() -> T + Send + Sync>;
type Setter<T> = Box<dyn Fn(T) + Send + Sync>;

struct ComputedInner<T> {
    runtime: Runtime,
    node: EffectId,
    label: Arc<str>,
    getter: Getter<T>,
    setter: Option<Setter<T>>,
    value: RwLock<Option<T>>,
    this: Weak<ComputedInner<T>>,
}

impl<T> ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn read(&self) -> T {
        // A node removed by `dispose` no longer tracks anything, so every
        // read recomputes.
        let stale = !self.runtime.effect_exists(self.node)
            || self.runtime.effect_dirty(self.node)
            || self.value.read().is_none();
        if stale {
            let fresh = self.runtime.run_tracked(self.node, || (self.getter)());
            let changed = {
                let mut cached = self.value.write();
                let changed = cached.as_ref() != Some(&fresh);
                *cached = Some(fresh.clone());
                changed
            };
            if changed {
                tracing::trace!(computed = %self.label, "computed value changed");
                self.runtime.trigger_computed(self.node, DirtyLevel::Dirty);
            }
        }

        let source: Weak<dyn ComputedSource> = self.this.clone();
        self.runtime.track_computed(self.node, source);

        let level = self.runtime.dirty_level(self.node);
        if level.is_some_and(|level| level >= DirtyLevel::MaybeDirtyComputedSideEffect) {
            self.runtime
                .trigger_computed(self.node, DirtyLevel::MaybeDirtyComputedSideEffect);
        }

        let cached = self.value.read().clone();
        cached.unwrap_or_else(|| (self.getter)())
    }
}

impl<T> ComputedSource for ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn refresh(&self) {
        self.read();
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        self.runtime.stop_effect(self.node);
    }
}

/// A cached derived value that recomputes only when dependencies change.
///
/// # Type Parameters
///
/// - `T`: The type of the computed value. Must be Clone + Send + Sync + PartialEq.
///
/// The PartialEq bound is needed to detect when the computed value actually
/// changed (a recomputation can produce the same value even if inputs
/// changed), in which case consumers are left alone.
///
/// Dropping the last handle stops the underlying effect.
pub struct Computed<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Runtime {
    /// Create a readonly computed value.
    ///
    /// The getter does not run until the value is first read.
    pub fn computed<T, F>(&self, getter: F) -> Computed<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.build_computed(Box::new(getter), None, "computed")
    }

    /// Create a computed value whose writes go through `setter`.
    pub fn computed_with_setter<T, F, S>(&self, getter: F, setter: S) -> Computed<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
        S: Fn(T) + Send + Sync + 'static,
    {
        self.build_computed(Box::new(getter), Some(Box::new(setter)), "computed")
    }

    /// Create a readonly computed value with a label for logs and errors.
    pub fn computed_labeled<T, F>(&self, label: &str, getter: F) -> Computed<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.build_computed(Box::new(getter), None, label)
    }

    fn build_computed<T>(&self, getter: Getter<T>, setter: Option<Setter<T>>, label: &str) -> Computed<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let label: Arc<str> = Arc::from(label);
        let node = self.graph().insert_effect(EffectNode::computed(label.clone()));
        let inner = Arc::new_cyclic(|this| ComputedInner {
            runtime: self.clone(),
            node,
            label,
            getter,
            setter,
            value: RwLock::new(None),
            this: this.clone(),
        });
        Computed { inner }
    }
}

impl<T> Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Get the current value, recomputing it if a dependency changed.
    ///
    /// If called while an effect is running, the effect becomes a consumer
    /// of this value.
    pub fn get(&self) -> T {
        self.inner.read()
    }

    /// Write through the setter.
    ///
    /// Fails with [`ReactiveError::ReadonlyComputed`] when there is none.
    pub fn set(&self, value: T) -> Result<()> {
        match &self.inner.setter {
            Some(setter) => {
                setter(value);
                Ok(())
            }
            None => {
                tracing::warn!(computed = %self.inner.label, "write to readonly computed value");
                Err(ReactiveError::ReadonlyComputed {
                    label: self.inner.label.to_string(),
                })
            }
        }
    }

    pub fn label(&self) -> Arc<str> {
        Arc::clone(&self.inner.label)
    }

    pub fn is_readonly(&self) -> bool {
        self.inner.setter.is_none()
    }

    /// The raw dirtiness level of the underlying effect.
    pub fn dirty_level(&self) -> Option<DirtyLevel> {
        self.inner.runtime.dirty_level(self.inner.node)
    }
}

impl<T> PartialEq for Computed<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for Computed<T> {}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("label", &self.inner.label)
            .field("cached", &*self.inner.value.read())
            .finish()
    }
}

// ---- Tests ----
