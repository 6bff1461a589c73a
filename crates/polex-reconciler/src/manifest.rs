//! Policy manifest watch events.
//!
//! The manifest stream is the only writer of the [`PolicyConfigCache`].
//! A deleted manifest removes its cache entry so later lookups report the
//! policy as unknown instead of serving a stale mode.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::PolicyConfigCache;
use crate::error::{ReconcileError, ReconcileResult};
use crate::model::PolicyManifest;

/// A change to a policy manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ManifestEvent {
    /// Manifest created or updated.
    Applied(PolicyManifest),
    /// Manifest removed.
    Deleted { name: String },
}

impl ManifestEvent {
    /// Policy id the event refers to.
    #[must_use]
    pub fn policy_id(&self) -> &str {
        match self {
            Self::Applied(manifest) => &manifest.name,
            Self::Deleted { name } => name,
        }
    }
}

/// Apply a manifest event to the cache.
pub fn apply_manifest_event(
    cache: &PolicyConfigCache,
    event: &ManifestEvent,
) -> ReconcileResult<()> {
    if event.policy_id().trim().is_empty() {
        return Err(ReconcileError::MalformedManifest {
            reason: "name is empty".to_string(),
        });
    }

    match event {
        ManifestEvent::Applied(manifest) => {
            let previous = cache.put(manifest.name.clone(), manifest.mode.clone());
            if previous.as_deref() != Some(manifest.mode.as_str()) {
                info!(
                    policy = %manifest.name,
                    mode = %manifest.mode,
                    previous = ?previous,
                    "Policy mode cached"
                );
            }
        }
        ManifestEvent::Deleted { name } => {
            if cache.delete(name).is_some() {
                info!(policy = %name, "Policy manifest deleted, cache entry removed");
            } else {
                debug!(policy = %name, "Deleted manifest was not cached");
            }
        }
    }
    Ok(())
}
