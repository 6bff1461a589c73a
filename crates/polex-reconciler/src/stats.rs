//! Reconcile outcome counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::DraftAction;

/// Point-in-time copy of the controller counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Events that reached the store or were filtered.
    pub reconciled: u64,
    pub skipped: u64,
    pub created: u64,
    pub patched: u64,
    pub unchanged: u64,
    pub deleted: u64,
    /// Events deferred on an unknown policy mode.
    pub deferred: u64,
    /// Keys handed to the requeue scheduler.
    pub requeued: u64,
    /// Events that ended in a store or draft error.
    pub failed: u64,
    /// Malformed events discarded.
    pub dropped: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
}

impl StatsSnapshot {
    /// Number of store writes.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.created + self.patched + self.deleted
    }
}

/// Thread-safe counters shared by all workers.
#[derive(Debug)]
pub struct ReconcileStats {
    reconciled: AtomicU64,
    skipped: AtomicU64,
    created: AtomicU64,
    patched: AtomicU64,
    unchanged: AtomicU64,
    deleted: AtomicU64,
    deferred: AtomicU64,
    requeued: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    started_at: DateTime<Utc>,
    start_time: Instant,
}

impl Default for ReconcileStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcileStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reconciled: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            created: AtomicU64::new(0),
            patched: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            started_at: Utc::now(),
            start_time: Instant::now(),
        }
    }

    /// Count a completed reconcile.
    pub fn record_action(&self, action: DraftAction) {
        let counter = match action {
            DraftAction::Skipped => &self.skipped,
            DraftAction::Created => &self.created,
            DraftAction::Patched => &self.patched,
            DraftAction::Unchanged => &self.unchanged,
            DraftAction::Deleted => &self.deleted,
            DraftAction::Absent => &self.reconciled,
            DraftAction::Deferred => {
                self.deferred.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if action != DraftAction::Absent {
            self.reconciled.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_requeue(&self) {
        self.requeued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reconciled: self.reconciled.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            created: self.created.load(Ordering::SeqCst),
            patched: self.patched.load(Ordering::SeqCst),
            unchanged: self.unchanged.load(Ordering::SeqCst),
            deleted: self.deleted.load(Ordering::SeqCst),
            deferred: self.deferred.load(Ordering::SeqCst),
            requeued: self.requeued.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            started_at: self.started_at,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}
