#![forbid(unsafe_code)]

//! Runtime limits for a reactive graph.
//!
//! The notify-depth limit bounds caller bugs: listeners that keep writing to
//! the cells that notified them. A well-formed graph never comes close to it.
//! Invalidating computed cells does not count against it, so dependency
//! chains may be arbitrarily long.
//!
//! Values are layered: built-in defaults, then the `CELLFLOW_MAX_NOTIFY_DEPTH`
//! environment variable, then explicit `with_*` calls.

use std::env;

/// Default bound on nested notification rounds.
pub const DEFAULT_MAX_NOTIFY_DEPTH: usize = 512;

const ENV_MAX_NOTIFY_DEPTH: &str = "CELLFLOW_MAX_NOTIFY_DEPTH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactiveConfig {
    /// Maximum nesting of notification rounds (a listener writing a cell whose
    /// listener writes another cell, and so on).
    pub max_notify_depth: usize,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            max_notify_depth: DEFAULT_MAX_NOTIFY_DEPTH,
        }
    }
}

impl ReactiveConfig {
    /// Defaults overridden by any valid environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// Unparseable or zero values are ignored.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(val) = lookup(ENV_MAX_NOTIFY_DEPTH)
            && let Ok(n) = val.trim().parse::<usize>()
            && n > 0
        {
            config.max_notify_depth = n;
        }
        config
    }

    #[must_use]
    pub fn with_max_notify_depth(mut self, depth: usize) -> Self {
        self.max_notify_depth = depth.max(1);
        self
    }
}
