//! Derived failure state per resource.
//!
//! Index of resource key → policy → failing rule names. An entry only
//! exists while it is non-empty: the last rule removed from a policy removes
//! the policy, and the last policy removed from a key removes the key.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::model::ResourceKey;

type PolicyRules = BTreeMap<String, BTreeSet<String>>;

/// A single change to the failing set of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Record `rule` of `policy` as failing.
    Add { policy: String, rule: String },
    /// Clear `rule` of `policy`.
    Remove { policy: String, rule: String },
}

impl Mutation {
    pub fn add(policy: impl Into<String>, rule: impl Into<String>) -> Self {
        Self::Add {
            policy: policy.into(),
            rule: rule.into(),
        }
    }

    pub fn remove(policy: impl Into<String>, rule: impl Into<String>) -> Self {
        Self::Remove {
            policy: policy.into(),
            rule: rule.into(),
        }
    }
}

/// Sharded in-memory failure index.
#[derive(Debug, Default)]
pub struct FailureTracker {
    entries: DashMap<ResourceKey, PolicyRules>,
}

impl FailureTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply all mutations of one event and return the resulting policy set.
    ///
    /// The whole batch runs under the key's shard lock.
    pub fn apply(&self, key: &ResourceKey, mutations: &[Mutation]) -> BTreeSet<String> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                apply_all(occupied.get_mut(), mutations);
                if occupied.get().is_empty() {
                    occupied.remove();
                    BTreeSet::new()
                } else {
                    occupied.get().keys().cloned().collect()
                }
            }
            Entry::Vacant(vacant) => {
                let mut rules = PolicyRules::new();
                apply_all(&mut rules, mutations);
                if rules.is_empty() {
                    BTreeSet::new()
                } else {
                    let policies = rules.keys().cloned().collect();
                    vacant.insert(rules);
                    policies
                }
            }
        }
    }

    /// Policies currently failing for `key`.
    #[must_use]
    pub fn policies(&self, key: &ResourceKey) -> BTreeSet<String> {
        self.entries
            .get(key)
            .map(|rules| rules.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Failing rules of one policy for `key`.
    #[must_use]
    pub fn rules(&self, key: &ResourceKey, policy: &str) -> BTreeSet<String> {
        self.entries
            .get(key)
            .and_then(|rules| rules.get(policy).cloned())
            .unwrap_or_default()
    }

    /// Drop all state for `key`. Returns true if anything was tracked.
    pub fn forget(&self, key: &ResourceKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Every key with a non-empty failing set.
    #[must_use]
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn apply_all(rules: &mut PolicyRules, mutations: &[Mutation]) {
    for mutation in mutations {
        match mutation {
            Mutation::Add { policy, rule } => {
                rules.entry(policy.clone()).or_default().insert(rule.clone());
            }
            Mutation::Remove { policy, rule } => {
                if let Some(set) = rules.get_mut(policy) {
                    set.remove(rule);
                    if set.is_empty() {
                        rules.remove(policy);
                    }
                }
            }
        }
    }
}
