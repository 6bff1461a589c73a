//! # Policy Exception Reconciler
//!
//! Derives policy exception drafts from a stream of per-resource policy
//! reports and keeps an external draft store converged to them.
//!
//! This crate provides:
//! - A policy configuration cache fed by policy manifest events
//! - Drafts declared directly by policy manifests
//! - An in-memory index of failing rules per resource
//! - The reconciliation engine that upserts or deletes drafts
//! - A de-duplicating work queue and worker pool with jittered requeue
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────┐     ┌───────────────────┐
//! │ Report events   │────►│  WorkQueue   │────►│  Workers (N)      │
//! │ (submit)        │     │  (per key)   │     │  Reconciler       │
//! └─────────────────┘     └──────▲───────┘     └─────────┬─────────┘
//!                                │                       │
//! ┌─────────────────┐     ┌──────┴───────┐     ┌─────────▼─────────┐
//! │ Manifest events │     │  Requeue     │     │ FailureTracker    │
//! │ (apply_manifest)│     │  Scheduler   │     │ PolicyConfigCache │
//! └────────┬────────┘     └──────────────┘     └─────────┬─────────┘
//!          │                                             │
//!          ▼                                             ▼
//!   PolicyConfigCache                           ┌───────────────────┐
//!                                               │   DraftStore      │
//!                                               └───────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use polex_reconciler::{
//!     FailureTracker, MemoryDraftStore, PolicyConfigCache, Reconciler, ReconcilerConfig,
//!     ReportController,
//! };
//!
//! let config = ReconcilerConfig::from_env()?;
//! let reconciler = Reconciler::new(
//!     config,
//!     Arc::new(PolicyConfigCache::new()),
//!     Arc::new(FailureTracker::new()),
//!     Arc::new(MemoryDraftStore::new()),
//! );
//! let controller = ReportController::new(reconciler);
//! tokio::spawn(controller.clone().run(cancel.clone()));
//! controller.submit(report)?;
//! ```

pub mod cache;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod kinds;
pub mod manifest;
pub mod model;
pub mod queue;
pub mod requeue;
pub mod stats;
pub mod store;
pub mod tracker;

pub use cache::PolicyConfigCache;
pub use config::ReconcilerConfig;
pub use controller::ReportController;
pub use engine::{DraftAction, ManifestOutcome, Outcome, Reconciler};
pub use error::{ConfigError, ReconcileError, ReconcileResult, StoreError, StoreResult};
pub use kinds::KindExpansion;
pub use manifest::{apply_manifest_event, ManifestEvent};
pub use model::{
    DraftMetadata, DraftSpec, DraftTarget, ExceptionDraft, PolicyManifest, ReportEvent,
    ReportResult, ReportScope, ResourceKey, ResultOutcome,
};
pub use queue::WorkQueue;
pub use requeue::{jittered_delay, RequeueScheduler};
pub use stats::{ReconcileStats, StatsSnapshot};
pub use store::{DraftStore, MemoryDraftStore};
pub use tracker::{FailureTracker, Mutation};
