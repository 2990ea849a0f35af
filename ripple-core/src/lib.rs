//! Ripple Core
//!
//! This crate provides a fine-grained reactive runtime: state containers that
//! record who reads them, effects that re-run when that state changes, and a
//! job queue that batches the re-runs. It implements:
//!
//! - Reactive containers (objects, vecs, maps and refs)
//! - Lazily evaluated computed values
//! - Effects with inline, queued, post-flush or custom scheduling
//! - Watchers with sync, pre and post flush timing and deep traversal
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Containers, computed values, effects, watchers and the
//!   runtime that ties them together
//! - `graph`: The dependency arena and the job queue
//! - `config`: Runtime and watcher settings
//! - `error`: Error types and the panic boundary payloads
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::{Runtime, WatchOptions};
//!
//! let runtime = Runtime::new();
//!
//! // Create a ref
//! let count = runtime.create_ref(0);
//!
//! // Create a derived value
//! let doubled = runtime.computed({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//!
//! // Create an effect
//! runtime.effect({
//!     let (count, doubled) = (count.clone(), doubled.clone());
//!     move || println!("Count: {}, Doubled: {}", count.get(), doubled.get())
//! });
//!
//! // Update the ref
//! count.set(5);
//! // Effect automatically runs, prints: "Count: 5, Doubled: 10"
//!
//! // Watchers run on the next flush by default
//! runtime.watch(count.clone(), |new, old, _| println!("{old:?} -> {new}"), WatchOptions::new());
//! count.set(6);
//! runtime.flush();
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::{Depth, FlushMode, RuntimeConfig};
pub use error::{ErrorPhase, ReactiveError, Result};
pub use graph::{ContainerId, DirtyLevel, Job, Key, TargetKind, TrackOp, TriggerOp};
pub use reactive::{
    Computed, Effect, EffectOptions, Many, OnCleanup, Reactive, ReactiveMap, ReactiveVec, Ref,
    Runtime, RuntimeStats, Traversal, Traverse, WatchHandle, WatchOptions, WatchSource,
};

pub use parking_lot::RwLock;
