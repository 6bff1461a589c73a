//! Wire and domain types: policy reports, policy manifests and exception drafts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, ReconcileResult};

/// Label value identifying drafts owned by this controller.
pub const COMPONENT_NAME: &str = "polex";
/// Label key for the managing component.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label key carrying the source resource name.
pub const RESOURCE_NAME_LABEL: &str = "polex.io/resource-name";
/// Label key carrying the source resource namespace.
pub const RESOURCE_NAMESPACE_LABEL: &str = "polex.io/resource-namespace";
/// Label key carrying the source resource kind.
pub const RESOURCE_KIND_LABEL: &str = "polex.io/resource-kind";
/// Label key marking drafts declared by policy manifests.
pub const ORIGIN_LABEL: &str = "polex.io/origin";
/// [`ORIGIN_LABEL`] value of manifest-declared drafts.
pub const ORIGIN_MANIFEST: &str = "policy-manifest";
/// Name suffix of manifest-declared drafts.
pub const DECLARED_SUFFIX: &str = "automated-exception";

/// Outcome of a single rule evaluation in a policy report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultOutcome {
    Pass,
    Fail,
    Skip,
    Warn,
    Error,
}

impl fmt::Display for ResultOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Skip => write!(f, "skip"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One rule result inside a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResult {
    /// Policy identifier.
    pub policy: String,
    /// Rule name within the policy.
    pub rule: String,
    /// Policy category, e.g. "Pod Security Standards (Restricted)".
    #[serde(default)]
    pub category: String,
    /// Evaluation outcome.
    pub result: ResultOutcome,
}

impl ReportResult {
    /// Create a result.
    pub fn new(
        policy: impl Into<String>,
        rule: impl Into<String>,
        category: impl Into<String>,
        result: ResultOutcome,
    ) -> Self {
        Self {
            policy: policy.into(),
            rule: rule.into(),
            category: category.into(),
            result,
        }
    }
}

/// The resource a report describes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportScope {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
}

impl ReportScope {
    /// Create a scope.
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
        }
    }

    /// Key identifying the derived state for this resource.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.kind, &self.name)
    }
}

/// A delivered policy report for one observed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEvent {
    #[serde(default)]
    pub scope: Option<ReportScope>,
    #[serde(default)]
    pub results: Vec<ReportResult>,
    #[serde(default)]
    pub deletion_requested: bool,
}

impl ReportEvent {
    /// Create a report for a scope with the given results.
    #[must_use]
    pub fn new(scope: ReportScope, results: Vec<ReportResult>) -> Self {
        Self {
            scope: Some(scope),
            results,
            deletion_requested: false,
        }
    }

    /// Mark the source resource as deleted.
    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.deletion_requested = true;
        self
    }

    /// Returns the scope after checking every required field is present.
    pub fn validated_scope(&self) -> ReconcileResult<&ReportScope> {
        let scope = self
            .scope
            .as_ref()
            .ok_or(ReconcileError::MalformedReport { field: "scope" })?;
        if scope.kind.trim().is_empty() {
            return Err(ReconcileError::MalformedReport { field: "scope.kind" });
        }
        if scope.name.trim().is_empty() {
            return Err(ReconcileError::MalformedReport { field: "scope.name" });
        }
        if scope.namespace.trim().is_empty() {
            return Err(ReconcileError::MalformedReport {
                field: "scope.namespace",
            });
        }
        Ok(scope)
    }

    /// Validated resource key for this report.
    pub fn resource_key(&self) -> ReconcileResult<ResourceKey> {
        self.validated_scope().map(ReportScope::key)
    }
}

/// Identity of a watched workload.
///
/// Kind is part of the key: a Deployment and a CronJob sharing a name are
/// separate workloads with separate failure state and separate drafts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl ResourceKey {
    /// Create a key.
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// Policy configuration object: the configured enforcement mode of a policy,
/// plus exceptions declared up front for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyManifest {
    /// Policy identifier.
    pub name: String,
    /// Configured mode, compared against the accepted mode.
    pub mode: String,
    /// Targets to draft exceptions for while the mode is accepted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<DraftTarget>,
}

impl PolicyManifest {
    /// Create a manifest without declared exceptions.
    pub fn new(name: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: mode.into(),
            exceptions: Vec::new(),
        }
    }

    /// Declare an exception target.
    #[must_use]
    pub fn with_exception(mut self, target: DraftTarget) -> Self {
        self.exceptions.push(target);
        self
    }
}

/// Object metadata of a stored draft.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Optimistic-concurrency token assigned by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Identity assigned by the store on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Resources an exception applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftTarget {
    pub namespaces: Vec<String>,
    pub names: Vec<String>,
    #[serde(rename = "kind")]
    pub kinds: Vec<String>,
}

impl DraftTarget {
    pub fn new<N, M, K>(namespaces: N, names: M, kinds: K) -> Self
    where
        N: IntoIterator,
        N::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
        K: IntoIterator,
        K::Item: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
            names: names.into_iter().map(Into::into).collect(),
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// First listed namespace. Declared targets must name at least one.
    pub fn first_namespace(&self) -> ReconcileResult<&str> {
        first_entry(&self.namespaces, "namespaces")
    }

    /// First listed name pattern. Declared targets must name at least one.
    pub fn first_name(&self) -> ReconcileResult<&str> {
        first_entry(&self.names, "names")
    }
}

fn first_entry<'a>(values: &'a [String], field: &str) -> ReconcileResult<&'a str> {
    values
        .first()
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ReconcileError::MalformedManifest {
            reason: format!("exception target has no {field}"),
        })
}

/// Desired content of a draft.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSpec {
    pub policies: Vec<String>,
    pub targets: Vec<DraftTarget>,
}

/// Derived exception recommendation for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDraft {
    pub metadata: DraftMetadata,
    pub spec: DraftSpec,
}

impl ExceptionDraft {
    /// Deterministic draft name for a resource: `<name>-<lowercase kind>`.
    ///
    /// One name per [`ResourceKey`]; the namespace is carried by the store.
    #[must_use]
    pub fn name_for(key: &ResourceKey) -> String {
        format!("{}-{}", key.name, key.kind.to_lowercase())
    }

    /// Build the draft that should exist for `scope` failing `policies`.
    ///
    /// `policies` are stored sorted so the serialized form is stable.
    #[must_use]
    pub fn for_resource(
        scope: &ReportScope,
        namespace: &str,
        policies: &BTreeSet<String>,
        kinds: Vec<String>,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), COMPONENT_NAME.to_string());
        labels.insert(RESOURCE_NAME_LABEL.to_string(), scope.name.clone());
        labels.insert(RESOURCE_NAMESPACE_LABEL.to_string(), scope.namespace.clone());
        labels.insert(RESOURCE_KIND_LABEL.to_string(), scope.kind.clone());

        Self {
            metadata: DraftMetadata {
                name: Self::name_for(&scope.key()),
                namespace: namespace.to_string(),
                labels,
                resource_version: None,
                uid: None,
            },
            spec: DraftSpec {
                policies: policies.iter().cloned().collect(),
                targets: vec![DraftTarget {
                    namespaces: vec![scope.namespace.clone()],
                    names: vec![format!("{}*", scope.name)],
                    kinds,
                }],
            },
        }
    }

    /// Build the draft a policy manifest declares for `target`.
    ///
    /// Named after the target's first name pattern with wildcards removed.
    /// Written to `destination` when set, else to the target's first namespace.
    pub fn for_declared_exception(
        policy: &str,
        target: &DraftTarget,
        destination: Option<&str>,
    ) -> ReconcileResult<Self> {
        let pattern = target.first_name()?;
        let base = pattern.replace('*', "");
        if base.trim().is_empty() {
            return Err(ReconcileError::MalformedManifest {
                reason: format!("exception name pattern '{pattern}' has no literal part"),
            });
        }
        let namespace = match destination {
            Some(namespace) => namespace.to_string(),
            None => target.first_namespace()?.to_string(),
        };

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), COMPONENT_NAME.to_string());
        labels.insert(ORIGIN_LABEL.to_string(), ORIGIN_MANIFEST.to_string());

        Ok(Self {
            metadata: DraftMetadata {
                name: format!("{base}-{DECLARED_SUFFIX}"),
                namespace,
                labels,
                resource_version: None,
                uid: None,
            },
            spec: DraftSpec {
                policies: vec![policy.to_string()],
                targets: vec![target.clone()],
            },
        })
    }

    /// True if a policy manifest declared this draft.
    #[must_use]
    pub fn is_declared(&self) -> bool {
        self.metadata
            .labels
            .get(ORIGIN_LABEL)
            .is_some_and(|v| v == ORIGIN_MANIFEST)
    }

    /// Policy ids as an unordered set.
    #[must_use]
    pub fn policy_set(&self) -> BTreeSet<&str> {
        self.spec.policies.iter().map(String::as_str).collect()
    }

    /// True if this draft lists exactly `policies`, ignoring order and duplicates.
    #[must_use]
    pub fn has_policies(&self, policies: &BTreeSet<String>) -> bool {
        let ours = self.policy_set();
        ours.len() == policies.len() && policies.iter().all(|p| ours.contains(p.as_str()))
    }

    /// The single target this controller writes, failing loudly when absent.
    pub fn primary_target(&self) -> ReconcileResult<&DraftTarget> {
        self.spec
            .targets
            .first()
            .ok_or_else(|| ReconcileError::InvalidDraft {
                namespace: self.metadata.namespace.clone(),
                name: self.metadata.name.clone(),
                reason: "spec.targets is empty".to_string(),
            })
    }

    /// True if the draft carries the managed-by label of this controller.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.metadata
            .labels
            .get(MANAGED_BY_LABEL)
            .is_some_and(|v| v == COMPONENT_NAME)
    }
}
