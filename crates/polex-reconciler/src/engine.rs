//! Reconciliation engine.
//!
//! Turns one report event into tracker mutations and converges the draft
//! store to the resulting failing policy set:
//!
//! ```text
//! event -> validate -> filter (namespace, kind, category)
//!       -> policy mode lookup -> tracker.apply
//!       -> indeterminate?  yes: Deferred, requeue, no store call
//!       -> policies?       non-empty: upsert  /  empty: delete
//! ```
//!
//! Policy manifests in the accepted mode may also declare exception targets
//! directly. [`Reconciler::reconcile_manifest`] keeps one
//! `<name>-automated-exception` draft per declared target and withdraws the
//! policy from declared drafts the manifest no longer lists.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cache::PolicyConfigCache;
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileResult, StoreError, StoreResult};
use crate::model::{
    ExceptionDraft, PolicyManifest, ReportEvent, ReportScope, ResourceKey, ResultOutcome,
};
use crate::store::DraftStore;
use crate::tracker::{FailureTracker, Mutation};

/// What the engine did to the draft of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftAction {
    /// Event filtered out. No state touched.
    Skipped,
    /// Draft did not exist and was created.
    Created,
    /// Stored draft had a different policy set and was replaced.
    Patched,
    /// Stored draft already matched.
    Unchanged,
    /// Draft existed and was removed.
    Deleted,
    /// No draft should exist and none did.
    Absent,
    /// A policy mode was unknown. Store left untouched until a retry.
    Deferred,
}

impl DraftAction {
    /// True if the store was written.
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Created | Self::Patched | Self::Deleted)
    }
}

/// Result of reconciling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub key: ResourceKey,
    pub action: DraftAction,
    /// Failing policies after the event was applied.
    pub policies: BTreeSet<String>,
    /// The caller should deliver this key again later.
    pub requeue: bool,
}

impl Outcome {
    #[must_use]
    pub fn skipped(key: ResourceKey) -> Self {
        Self {
            key,
            action: DraftAction::Skipped,
            policies: BTreeSet::new(),
            requeue: false,
        }
    }

    #[must_use]
    pub fn deferred(key: ResourceKey, policies: BTreeSet<String>) -> Self {
        Self {
            key,
            action: DraftAction::Deferred,
            policies,
            requeue: true,
        }
    }

    fn converged(key: ResourceKey, action: DraftAction, policies: BTreeSet<String>) -> Self {
        Self {
            key,
            action,
            policies,
            requeue: false,
        }
    }
}

/// Drafts touched while syncing the exceptions of one policy manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestOutcome {
    pub policy: String,
    /// Draft name → what was done to it.
    pub drafts: BTreeMap<String, DraftAction>,
}

impl ManifestOutcome {
    fn new(policy: &str) -> Self {
        Self {
            policy: policy.to_string(),
            drafts: BTreeMap::new(),
        }
    }
}

/// Reconciles report events against the draft store.
pub struct Reconciler {
    config: Arc<ReconcilerConfig>,
    cache: Arc<PolicyConfigCache>,
    tracker: Arc<FailureTracker>,
    store: Arc<dyn DraftStore>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        cache: Arc<PolicyConfigCache>,
        tracker: Arc<FailureTracker>,
        store: Arc<dyn DraftStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            cache,
            tracker,
            store,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PolicyConfigCache> {
        &self.cache
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<FailureTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DraftStore> {
        &self.store
    }

    /// Namespace the draft for `scope` lives in.
    #[must_use]
    pub fn draft_namespace<'a>(&'a self, scope: &'a ReportScope) -> &'a str {
        self.config
            .destination_namespace
            .as_deref()
            .unwrap_or(&scope.namespace)
    }

    /// Reconcile one report event.
    #[instrument(skip_all, fields(key = tracing::field::Empty))]
    pub async fn reconcile(&self, event: &ReportEvent) -> ReconcileResult<Outcome> {
        let scope = event.validated_scope()?;
        let key = scope.key();
        tracing::Span::current().record("key", tracing::field::display(&key));

        if self.config.exclude_namespaces.contains(&scope.namespace) {
            debug!(namespace = %scope.namespace, "Namespace excluded, skipping report");
            return Ok(Outcome::skipped(key));
        }
        if !self.config.target_workloads.contains(&scope.kind) {
            debug!(kind = %scope.kind, "Kind not targeted, skipping report");
            return Ok(Outcome::skipped(key));
        }

        let policies = if event.deletion_requested {
            if self.tracker.forget(&key) {
                debug!("Resource deleted, failure state forgotten");
            }
            BTreeSet::new()
        } else {
            let (mutations, indeterminate) = self.mutations_for(event);
            let policies = self.tracker.apply(&key, &mutations);
            if indeterminate {
                debug!(
                    policies = policies.len(),
                    "Policy mode unknown, deferring draft update"
                );
                return Ok(Outcome::deferred(key, policies));
            }
            policies
        };

        let name = ExceptionDraft::name_for(&key);
        let namespace = self.draft_namespace(scope);

        let action = if policies.is_empty() {
            self.remove_draft(namespace, &name).await?
        } else {
            let kinds = self.config.kind_expansion.expand(&scope.kind);
            let desired = ExceptionDraft::for_resource(scope, namespace, &policies, kinds);
            self.upsert(desired).await?
        };

        Ok(Outcome::converged(key, action, policies))
    }

    /// Converge the drafts declared by `manifest`.
    ///
    /// In the accepted mode every declared target gets a draft listing the
    /// policy. Declared drafts that list the policy but are no longer declared,
    /// or every such draft when the mode is not accepted, have the policy
    /// withdrawn. A malformed target fails the call before any store write.
    #[instrument(skip_all, fields(policy = %manifest.name))]
    pub async fn reconcile_manifest(
        &self,
        manifest: &PolicyManifest,
    ) -> ReconcileResult<ManifestOutcome> {
        let desired = if manifest.mode == self.config.accepted_mode {
            if manifest.exceptions.is_empty() {
                debug!("Manifest declares no exceptions");
            }
            manifest
                .exceptions
                .iter()
                .map(|target| {
                    ExceptionDraft::for_declared_exception(
                        &manifest.name,
                        target,
                        self.config.destination_namespace.as_deref(),
                    )
                })
                .collect::<ReconcileResult<Vec<_>>>()?
        } else {
            Vec::new()
        };
        self.sync_declared(&manifest.name, desired).await
    }

    /// Withdraw a deleted manifest's policy from every draft it declared.
    #[instrument(skip(self))]
    pub async fn withdraw_manifest(&self, policy: &str) -> ReconcileResult<ManifestOutcome> {
        self.sync_declared(policy, Vec::new()).await
    }

    async fn sync_declared(
        &self,
        policy: &str,
        desired: Vec<ExceptionDraft>,
    ) -> ReconcileResult<ManifestOutcome> {
        let mut outcome = ManifestOutcome::new(policy);
        let mut kept = BTreeSet::new();

        for draft in desired {
            kept.insert((draft.metadata.namespace.clone(), draft.metadata.name.clone()));
            let name = draft.metadata.name.clone();
            let action = self.upsert_declared(draft, policy).await?;
            outcome.drafts.insert(name, action);
        }

        let stored = self.guarded(self.store.list(None)).await?;
        for draft in stored {
            if !draft.is_managed() || !draft.is_declared() {
                continue;
            }
            if !draft.spec.policies.iter().any(|p| p == policy) {
                continue;
            }
            if kept.contains(&(draft.metadata.namespace.clone(), draft.metadata.name.clone())) {
                continue;
            }
            let name = draft.metadata.name.clone();
            let action = self.withdraw_declared(draft, policy).await?;
            outcome.drafts.insert(name, action);
        }

        Ok(outcome)
    }

    /// Create the declared draft, or add `policy` to the stored one and
    /// refresh its target. Several manifests may declare the same target.
    async fn upsert_declared(
        &self,
        mut desired: ExceptionDraft,
        policy: &str,
    ) -> ReconcileResult<DraftAction> {
        let namespace = desired.metadata.namespace.clone();
        let name = desired.metadata.name.clone();

        let existing = self.guarded(self.store.get(&namespace, &name)).await?;
        let Some(existing) = existing else {
            self.guarded(self.store.create(&desired)).await?;
            info!(
                draft = %format!("{namespace}/{name}"),
                policy = %policy,
                "Declared exception draft created"
            );
            return Ok(DraftAction::Created);
        };

        let mut policies: BTreeSet<String> = existing.spec.policies.iter().cloned().collect();
        let listed = !policies.insert(policy.to_string());
        if listed && existing.spec.targets == desired.spec.targets {
            debug!(draft = %format!("{namespace}/{name}"), "Declared exception draft up to date");
            return Ok(DraftAction::Unchanged);
        }

        desired.spec.policies = policies.into_iter().collect();
        desired.metadata.resource_version = existing.metadata.resource_version;
        desired.metadata.uid = existing.metadata.uid;
        self.guarded(self.store.patch(&desired)).await?;
        info!(
            draft = %format!("{namespace}/{name}"),
            policies = ?desired.spec.policies,
            "Declared exception draft updated"
        );
        Ok(DraftAction::Patched)
    }

    /// Remove `policy` from a declared draft, deleting it once no policy is left.
    async fn withdraw_declared(
        &self,
        mut draft: ExceptionDraft,
        policy: &str,
    ) -> ReconcileResult<DraftAction> {
        draft.spec.policies.retain(|p| p != policy);
        if draft.spec.policies.is_empty() {
            return self
                .remove_draft(&draft.metadata.namespace, &draft.metadata.name)
                .await;
        }

        self.guarded(self.store.patch(&draft)).await?;
        info!(
            draft = %format!("{}/{}", draft.metadata.namespace, draft.metadata.name),
            policy = %policy,
            "Policy withdrawn from declared exception draft"
        );
        Ok(DraftAction::Patched)
    }

    /// Tracker mutations for the targeted results of `event`, and whether any
    /// failing policy had no known mode.
    fn mutations_for(&self, event: &ReportEvent) -> (Vec<Mutation>, bool) {
        let mut mutations = Vec::new();
        let mut indeterminate = false;

        for result in &event.results {
            if !self.config.target_categories.contains(&result.category) {
                continue;
            }
            match result.result {
                ResultOutcome::Fail => match self.cache.lookup(&result.policy) {
                    None => {
                        debug!(policy = %result.policy, "Policy mode not cached yet");
                        indeterminate = true;
                    }
                    Some(mode) if mode == self.config.accepted_mode => {
                        mutations.push(Mutation::add(&result.policy, &result.rule));
                    }
                    Some(mode) => {
                        debug!(
                            policy = %result.policy,
                            mode = %mode,
                            "Policy not in accepted mode"
                        );
                        mutations.push(Mutation::remove(&result.policy, &result.rule));
                    }
                },
                ResultOutcome::Pass => {
                    mutations.push(Mutation::remove(&result.policy, &result.rule));
                }
                ResultOutcome::Skip | ResultOutcome::Warn | ResultOutcome::Error => {}
            }
        }

        (mutations, indeterminate)
    }

    async fn upsert(&self, mut desired: ExceptionDraft) -> ReconcileResult<DraftAction> {
        let namespace = desired.metadata.namespace.clone();
        let name = desired.metadata.name.clone();

        let existing = self.guarded(self.store.get(&namespace, &name)).await?;
        let Some(existing) = existing else {
            self.guarded(self.store.create(&desired)).await?;
            info!(
                draft = %format!("{namespace}/{name}"),
                policies = ?desired.spec.policies,
                "Exception draft created"
            );
            return Ok(DraftAction::Created);
        };

        let policies: BTreeSet<String> = desired.spec.policies.iter().cloned().collect();
        let target_valid = match existing.primary_target() {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Stored draft has no target, rewriting");
                false
            }
        };
        if target_valid && existing.has_policies(&policies) {
            debug!(draft = %format!("{namespace}/{name}"), "Exception draft up to date");
            return Ok(DraftAction::Unchanged);
        }

        desired.metadata.resource_version = existing.metadata.resource_version;
        desired.metadata.uid = existing.metadata.uid;
        self.guarded(self.store.patch(&desired)).await?;
        info!(
            draft = %format!("{namespace}/{name}"),
            policies = ?desired.spec.policies,
            "Exception draft updated"
        );
        Ok(DraftAction::Patched)
    }

    async fn remove_draft(&self, namespace: &str, name: &str) -> ReconcileResult<DraftAction> {
        match self.guarded(self.store.delete(namespace, name)).await {
            Ok(()) => {
                info!(draft = %format!("{namespace}/{name}"), "Exception draft deleted");
                Ok(DraftAction::Deleted)
            }
            Err(e) if e.is_not_found() => Ok(DraftAction::Absent),
            Err(e) => Err(e.into()),
        }
    }

    /// Bound a store call by the configured timeout.
    async fn guarded<T, F>(&self, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.config.store_timeout(), call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.config.store_timeout_ms, "Store call timed out");
                Err(StoreError::Timeout {
                    timeout_ms: self.config.store_timeout_ms,
                })
            }
        }
    }
}
