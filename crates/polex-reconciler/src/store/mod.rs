//! Exception draft store.
//!
//! The authoritative home of [`ExceptionDraft`] objects. Writes use
//! optimistic concurrency: a patch carries the `resource_version` it was
//! read at and fails with [`StoreError::Conflict`] when the stored object
//! moved on in the meantime.

mod memory;

pub use memory::MemoryDraftStore;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::ExceptionDraft;

/// Access to the external draft store.
#[async_trait]
pub trait DraftStore: Send + Sync {
    /// Fetch a draft. `Ok(None)` when it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<ExceptionDraft>>;

    /// Create a new draft.
    ///
    /// Returns the stored object with its assigned `resource_version` and `uid`.
    async fn create(&self, draft: &ExceptionDraft) -> StoreResult<ExceptionDraft>;

    /// Replace an existing draft.
    ///
    /// `draft.metadata.resource_version` must match the stored version.
    async fn patch(&self, draft: &ExceptionDraft) -> StoreResult<ExceptionDraft>;

    /// Delete a draft.
    ///
    /// Returns [`StoreError::NotFound`](crate::error::StoreError::NotFound)
    /// when there is nothing to delete.
    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()>;

    /// List drafts, optionally restricted to one namespace.
    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<ExceptionDraft>>;
}
