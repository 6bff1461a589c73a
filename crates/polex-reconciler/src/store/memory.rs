//! In-process draft store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::DraftStore;
use crate::error::{StoreError, StoreResult};
use crate::model::ExceptionDraft;

type DraftKey = (String, String);

/// [`DraftStore`] kept in memory, with resource-version bookkeeping that
/// behaves like an API server.
#[derive(Debug, Default)]
pub struct MemoryDraftStore {
    drafts: RwLock<BTreeMap<DraftKey, ExceptionDraft>>,
    version: AtomicU64,
}

impl MemoryDraftStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored drafts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.drafts.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.drafts.read().is_empty()
    }

    /// Every stored draft, ordered by namespace then name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ExceptionDraft> {
        self.drafts.read().values().cloned().collect()
    }

    /// Read a draft without going through the async trait.
    #[must_use]
    pub fn peek(&self, namespace: &str, name: &str) -> Option<ExceptionDraft> {
        self.drafts
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

fn key_of(draft: &ExceptionDraft) -> DraftKey {
    (
        draft.metadata.namespace.clone(),
        draft.metadata.name.clone(),
    )
}

#[async_trait]
impl DraftStore for MemoryDraftStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<ExceptionDraft>> {
        Ok(self.peek(namespace, name))
    }

    async fn create(&self, draft: &ExceptionDraft) -> StoreResult<ExceptionDraft> {
        let mut drafts = self.drafts.write();
        let key = key_of(draft);
        if drafts.contains_key(&key) {
            return Err(StoreError::Conflict {
                namespace: key.0,
                name: key.1,
                message: "already exists".to_string(),
            });
        }

        let mut stored = draft.clone();
        stored.metadata.resource_version = Some(self.next_version());
        stored.metadata.uid = Some(Uuid::new_v4().to_string());
        drafts.insert(key, stored.clone());
        Ok(stored)
    }

    async fn patch(&self, draft: &ExceptionDraft) -> StoreResult<ExceptionDraft> {
        let mut drafts = self.drafts.write();
        let key = key_of(draft);
        let Some(current) = drafts.get(&key) else {
            return Err(StoreError::NotFound {
                namespace: key.0,
                name: key.1,
            });
        };

        if draft.metadata.resource_version != current.metadata.resource_version {
            return Err(StoreError::Conflict {
                namespace: key.0,
                name: key.1,
                message: format!(
                    "resource version {:?} is stale, current is {:?}",
                    draft.metadata.resource_version, current.metadata.resource_version
                ),
            });
        }

        let mut stored = draft.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.resource_version = Some(self.next_version());
        drafts.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.drafts
            .write()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<ExceptionDraft>> {
        Ok(self
            .drafts
            .read()
            .values()
            .filter(|d| namespace.map_or(true, |ns| d.metadata.namespace == ns))
            .cloned()
            .collect())
    }
}
