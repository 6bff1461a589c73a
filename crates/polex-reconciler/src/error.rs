//! Error types for the polex reconciler.
//!
//! Store errors carry a transient/fatal classification that the controller
//! uses to decide between requeueing a key and stopping altogether.

use thiserror::Error;

/// Errors returned by a [`DraftStore`](crate::store::DraftStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The requested draft does not exist.
    #[error("draft not found: {namespace}/{name}")]
    NotFound { namespace: String, name: String },

    /// The draft changed since it was read (stale resource version).
    #[error("conflict writing draft {namespace}/{name}: {message}")]
    Conflict {
        namespace: String,
        name: String,
        message: String,
    },

    /// The store did not answer within the configured timeout.
    #[error("store call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The store is temporarily unreachable.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// The store rejected our identity or permissions.
    #[error("store rejected credentials: {message}")]
    Unauthorized { message: String },

    /// Any other store failure.
    #[error("store error: {message}")]
    Internal { message: String },
}

impl StoreError {
    /// Returns true if this error is a not-found response.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if retrying later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Timeout { .. } | Self::Unavailable { .. }
        )
    }

    /// Returns true if the operator has to intervene.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reconciling a single report event.
#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    /// The report is missing a required scope field.
    #[error("malformed report: missing {field}")]
    MalformedReport { field: &'static str },

    /// The manifest cannot be applied to the configuration cache.
    #[error("malformed policy manifest: {reason}")]
    MalformedManifest { reason: String },

    /// A stored draft violates its own invariants.
    #[error("invalid draft {namespace}/{name}: {reason}")]
    InvalidDraft {
        namespace: String,
        name: String,
        reason: String,
    },

    /// The draft store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The controller was started with an unusable configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ReconcileError {
    /// Returns true if the event should be retried later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the error must be surfaced to the operator.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Store(e) => e.is_fatal(),
            Self::Config(_) => true,
            _ => false,
        }
    }

    /// Returns true if the input itself is unusable and should be dropped.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MalformedReport { .. } | Self::MalformedManifest { .. }
        )
    }
}

/// Result type for reconcile operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
