//! Reactive Context
//!
//! The reactive context tracks which effect is currently running.
//! This enables automatic dependency tracking: when reactive state is read,
//! the runtime registers the current effect as a subscriber.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Running an effect pushes a frame
//! naming the runtime and the effect; pausing pushes a frame that names no
//! effect at all. Reads only look at the top frame, so a paused frame hides
//! every running effect below it until the pause guard drops.
//!
//! Frames are popped by guards, which keeps the stack balanced even if the
//! computation panics.

use std::cell::RefCell;

use crate::graph::EffectId;

use super::runtime::RuntimeId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the reactive context stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextEntry {
    /// An effect of `runtime` is running and collecting dependencies.
    Running { runtime: RuntimeId, effect: EffectId },
    /// Tracking is paused for every runtime.
    Paused,
}

/// Guard that pops its context frame when dropped.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct ReactiveContext {
    entry: ContextEntry,
}

impl ReactiveContext {
    /// Enter a frame for a running effect.
    pub(crate) fn enter(runtime: RuntimeId, effect: EffectId) -> Self {
        Self::push(ContextEntry::Running { runtime, effect })
    }

    /// Pause tracking until the returned guard is dropped.
    ///
    /// Pauses nest: tracking resumes only when the innermost effect frame is
    /// back on top of the stack.
    pub fn pause() -> Self {
        Self::push(ContextEntry::Paused)
    }

    fn push(entry: ContextEntry) -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(entry));
        Self { entry }
    }

    /// Check if an effect is collecting dependencies on this thread.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| {
            matches!(stack.borrow().last(), Some(ContextEntry::Running { .. }))
        })
    }

    /// Check if tracking is paused on this thread.
    pub fn is_paused() -> bool {
        CONTEXT_STACK.with(|stack| matches!(stack.borrow().last(), Some(ContextEntry::Paused)))
    }

    /// The effect reads of `runtime` should be tracked against, if any.
    pub(crate) fn active_effect(runtime: RuntimeId) -> Option<EffectId> {
        CONTEXT_STACK.with(|stack| match stack.borrow().last() {
            Some(ContextEntry::Running {
                runtime: owner,
                effect,
            }) if *owner == runtime => Some(*effect),
            _ => None,
        })
    }

    /// Number of frames on this thread's stack.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Guards must drop in reverse order of creation.
            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry, self.entry,
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    self.entry, entry
                );
            }
        });
    }
}
