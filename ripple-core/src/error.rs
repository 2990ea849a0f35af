//! Error types for the reactive runtime.
//!
//! Failures fall into three groups:
//!
//! - Panics raised by user code while the runtime drives it (effect re-runs,
//!   queued jobs, post-flush jobs, watch getters, callbacks and cleanups). These are caught
//!   at the boundary that invoked the code and handed to the runtime's error
//!   handler so sibling work keeps running.
//! - Misuse detected at call time, such as writing to a computed value that
//!   has no setter. These are returned to the caller directly.
//! - Configuration that fails to parse.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Result alias used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

/// Callback receiving errors caught by the runtime.
pub type ErrorHandler = Arc<dyn Fn(&ReactiveError) + Send + Sync>;

/// Where a caught failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPhase {
    /// An effect re-run or custom scheduler invoked by a write.
    Effect,
    /// A job running in the main phase of a flush.
    Scheduler,
    /// A job running in the post phase of a flush.
    PostFlush,
    /// The source getter of a watcher.
    WatchGetter,
    /// The user callback of a watcher.
    WatchCallback,
    /// A cleanup registered through `OnCleanup`.
    WatchCleanup,
}

impl fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorPhase::Effect => "effect run",
            ErrorPhase::Scheduler => "scheduler flush",
            ErrorPhase::PostFlush => "post flush",
            ErrorPhase::WatchGetter => "watcher getter",
            ErrorPhase::WatchCallback => "watcher callback",
            ErrorPhase::WatchCleanup => "watcher cleanup",
        };
        f.write_str(name)
    }
}

/// Errors produced by the reactive runtime.
#[derive(Debug, thiserror::Error)]
pub enum ReactiveError {
    /// User code panicked while the runtime was driving it.
    #[error("`{owner}` panicked during {phase}: {message}")]
    Panicked {
        /// Label of the effect, job or watcher that failed.
        owner: String,
        /// Where the failure happened.
        phase: ErrorPhase,
        /// The panic payload, rendered as text.
        message: String,
    },

    /// A write was attempted on a computed value without a setter.
    #[error("computed value `{label}` is readonly")]
    ReadonlyComputed {
        /// Label of the computed value.
        label: String,
    },

    /// Runtime configuration failed to parse.
    #[error("invalid runtime config: {0}")]
    Config(#[from] serde_json::Error),
}

impl ReactiveError {
    /// Build a `Panicked` error from a payload returned by `catch_unwind`.
    pub(crate) fn from_panic(
        owner: impl Into<String>,
        phase: ErrorPhase,
        payload: Box<dyn Any + Send>,
    ) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };

        ReactiveError::Panicked {
            owner: owner.into(),
            phase,
            message,
        }
    }

    /// The phase in which the error was caught, if it came from user code.
    pub fn phase(&self) -> Option<ErrorPhase> {
        match self {
            ReactiveError::Panicked { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
