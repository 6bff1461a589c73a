//! Ownership-chain expansion for draft target kinds.
//!
//! A workload controller creates child objects (a Deployment creates
//! ReplicaSets, a CronJob creates Jobs, and all of them end in Pods). A draft
//! for the workload also has to cover those children, so the target kind list
//! is the workload kind followed by its spawned kinds.

use std::collections::HashMap;

/// Default terminal kind of every ownership chain.
pub const DEFAULT_TERMINAL_KIND: &str = "Pod";

/// Table of kind → spawned intermediate kind, plus the terminal kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindExpansion {
    children: HashMap<String, String>,
    terminal: String,
}

impl Default for KindExpansion {
    fn default() -> Self {
        Self::empty(DEFAULT_TERMINAL_KIND)
            .with_child("Deployment", "ReplicaSet")
            .with_child("CronJob", "Job")
    }
}

impl KindExpansion {
    /// A table with no intermediate kinds.
    pub fn empty(terminal: impl Into<String>) -> Self {
        Self {
            children: HashMap::new(),
            terminal: terminal.into(),
        }
    }

    /// Register the intermediate kind spawned by `kind`.
    #[must_use]
    pub fn with_child(mut self, kind: impl Into<String>, child: impl Into<String>) -> Self {
        self.children.insert(kind.into(), child.into());
        self
    }

    /// The terminal (pod-like) kind.
    #[must_use]
    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    /// Expand `kind` into its full ownership chain.
    #[must_use]
    pub fn expand(&self, kind: &str) -> Vec<String> {
        let mut kinds = vec![kind.to_string()];
        if let Some(child) = self.children.get(kind) {
            kinds.push(child.clone());
        }
        if kind != self.terminal {
            kinds.push(self.terminal.clone());
        }
        kinds
    }
}
