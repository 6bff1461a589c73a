//! In-memory policy configuration cache.
//!
//! Maps policy id to its configured mode. Populated by the manifest watch
//! stream and read on every report event. A miss is reported immediately and
//! means "unknown", which callers treat as indeterminate rather than as a
//! non-matching mode.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Cache of policy id → configured mode.
#[derive(Debug, Default)]
pub struct PolicyConfigCache {
    modes: RwLock<HashMap<String, String>>,
}

impl PolicyConfigCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the mode of a policy.
    ///
    /// Returns the previous mode, if any.
    pub fn put(&self, policy_id: impl Into<String>, mode: impl Into<String>) -> Option<String> {
        self.modes.write().insert(policy_id.into(), mode.into())
    }

    /// Remove a policy. Returns the removed mode, if any.
    pub fn delete(&self, policy_id: &str) -> Option<String> {
        self.modes.write().remove(policy_id)
    }

    /// Look up the configured mode of a policy. `None` means unknown.
    #[must_use]
    pub fn lookup(&self, policy_id: &str) -> Option<String> {
        self.modes.read().get(policy_id).cloned()
    }

    /// Number of cached policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modes.read().len()
    }

    /// Returns true if nothing is cached yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modes.read().is_empty()
    }
}
