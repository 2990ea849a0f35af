//! Reactive Primitives
//!
//! This module implements the user-facing half of the reactive system:
//! containers, computed values, effects and watchers, all bound to a
//! [`Runtime`].
//!
//! # Concepts
//!
//! ## Containers
//!
//! A container wraps a value so that reads and writes through it are
//! observable. [`Reactive`] wraps a struct with named fields, [`ReactiveVec`]
//! and [`ReactiveMap`] wrap collections, and [`Ref`] wraps a single value.
//! Reads inside a running effect subscribe the effect to the location read;
//! writes notify the subscribers of the locations they change.
//!
//! ## Computed Values
//!
//! A [`Computed`] caches the result of a getter. It is recomputed lazily, on
//! the first read after one of its dependencies changed, and only notifies
//! its own consumers when the new value differs from the cached one.
//!
//! ## Effects
//!
//! An [`Effect`] is a computation that re-runs when what it read changes. It
//! can re-run inline, or hand itself to the job queue so that several writes
//! produce one run per flush.
//!
//! ## Watchers
//!
//! A watcher compares a source value across runs and calls a callback with
//! the new and previous value. See [`Runtime::watch`].
//!
//! # Implementation Notes
//!
//! The running effect is found through a thread-local context stack, so
//! dependencies are detected without being declared. The graph that stores
//! them lives in [`crate::graph`].

mod cell;
mod collections;
mod computed;
mod container;
mod context;
mod effect;
mod runtime;
mod traverse;
mod watch;

pub use cell::Ref;
pub use collections::{ReactiveMap, ReactiveVec};
pub use computed::Computed;
pub use container::Reactive;
pub use context::ReactiveContext;
pub use effect::{Effect, EffectOptions, SchedulerFn};
pub use runtime::{Runtime, RuntimeId, RuntimeStats};
pub use traverse::{Traversal, Traverse};
pub use watch::{Many, OnCleanup, WatchHandle, WatchOptions, WatchSource};

pub(crate) use effect::Scheduling;
