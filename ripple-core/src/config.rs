//! Runtime Configuration
//!
//! Settings are plain serde types so hosts can keep them next to the rest of
//! their configuration. Every field has a default, so `{}` is a valid config.
//!
//! ```json
//! {
//!     "label": "app",
//!     "default_flush": "pre",
//!     "catch_panics": true
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// When a watcher's callback runs relative to the mutation that triggered it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Synchronously, as soon as the triggering write completes.
    Sync,
    /// Deferred to the main phase of the next flush, ahead of non-pre jobs
    /// with the same priority id.
    #[default]
    Pre,
    /// Deferred to the post phase of the next flush.
    Post,
}

/// How far a deep traversal descends into nested reactive containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    /// Only the keys of the outermost container.
    Shallow,
    /// At most this many container levels.
    Bounded(usize),
    /// Every reachable container.
    Unlimited,
}

impl Depth {
    /// The number of levels to visit, `None` meaning no limit.
    pub fn levels(self) -> Option<usize> {
        match self {
            Depth::Shallow => Some(1),
            Depth::Bounded(n) => Some(n),
            Depth::Unlimited => None,
        }
    }
}

/// Configuration for a [`Runtime`](crate::reactive::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name attached to log events emitted by this runtime.
    pub label: String,

    /// Flush timing used by watchers that do not pick one.
    pub default_flush: FlushMode,

    /// Catch panics at effect, job and watcher boundaries and forward them to the
    /// error handler. When disabled, panics unwind into the caller.
    pub catch_panics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            label: "ripple".to_string(),
            default_flush: FlushMode::Pre,
            catch_panics: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse a config from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_default_flush(mut self, flush: FlushMode) -> Self {
        self.default_flush = flush;
        self
    }

    pub fn with_catch_panics(mut self, catch_panics: bool) -> Self {
        self.catch_panics = catch_panics;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.default_flush, FlushMode::Pre);
        assert!(config.catch_panics);
    }

    #[test]
    fn parses_flush_modes() {
        let config =
            RuntimeConfig::from_json(r#"{"label":"app","default_flush":"post"}"#).unwrap();
        assert_eq!(config.label, "app");
        assert_eq!(config.default_flush, FlushMode::Post);

        let sync: FlushMode = serde_json::from_str(r#""sync""#).unwrap();
        assert_eq!(sync, FlushMode::Sync);
    }

    #[test]
    fn rejects_unknown_flush_mode() {
        let err = RuntimeConfig::from_json(r#"{"default_flush":"later"}"#).unwrap_err();
        assert!(err.to_string().starts_with("invalid runtime config"));
    }

    #[test]
    fn depth_levels() {
        assert_eq!(Depth::Shallow.levels(), Some(1));
        assert_eq!(Depth::Bounded(3).levels(), Some(3));
        assert_eq!(Depth::Unlimited.levels(), None);

        let depth: Depth = serde_json::from_str(r#"{"bounded":2}"#).unwrap();
        assert_eq!(depth, Depth::Bounded(2));
    }
}
