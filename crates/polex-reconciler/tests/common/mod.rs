//! Shared fixtures for the reconciler integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use polex_reconciler::{
    DraftStore, ExceptionDraft, FailureTracker, MemoryDraftStore, PolicyConfigCache, Reconciler,
    ReconcilerConfig, ReportEvent, ReportResult, ReportScope, ResultOutcome, StoreError,
    StoreResult,
};

pub const PSS_RESTRICTED: &str = "Pod Security Standards (Restricted)";
pub const ACCEPTED_MODE: &str = "warming";

// =============================================================================
// Manual Mock Store
// =============================================================================

/// Failure injected into the next store calls.
#[derive(Debug, Clone, Copy)]
pub enum MockFailure {
    Unavailable,
    Unauthorized,
}

/// Draft store wrapping [`MemoryDraftStore`] with call counters, optional
/// latency and failure injection.
pub struct CountingStore {
    inner: MemoryDraftStore,
    get_calls: AtomicUsize,
    create_calls: AtomicUsize,
    patch_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    latency_ms: AtomicU64,
    failures_remaining: AtomicUsize,
    failure: Mutex<Option<MockFailure>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_overlap: AtomicUsize,
}

impl Default for CountingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: MemoryDraftStore::new(),
            get_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            patch_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
            failures_remaining: AtomicUsize::new(0),
            failure: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
            max_overlap: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` calls with `failure`.
    pub fn fail_next(&self, failure: MockFailure, count: usize) {
        *self.failure.lock() = Some(failure);
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn patch_calls(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Total store calls of any kind.
    pub fn calls(&self) -> usize {
        self.get_calls() + self.create_calls() + self.patch_calls() + self.delete_calls()
    }

    /// Writes (create, patch, delete).
    pub fn writes(&self) -> usize {
        self.create_calls() + self.patch_calls() + self.delete_calls()
    }

    /// Highest number of concurrent calls observed for a single draft name.
    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }

    pub fn peek(&self, namespace: &str, name: &str) -> Option<ExceptionDraft> {
        self.inner.peek(namespace, name)
    }

    pub fn snapshot(&self) -> Vec<ExceptionDraft> {
        self.inner.snapshot()
    }

    fn injected_failure(&self) -> Option<StoreError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining == 0 {
            return None;
        }
        self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
        match *self.failure.lock() {
            Some(MockFailure::Unavailable) => Some(StoreError::Unavailable {
                message: "connection refused".to_string(),
            }),
            Some(MockFailure::Unauthorized) => Some(StoreError::Unauthorized {
                message: "token expired".to_string(),
            }),
            None => None,
        }
    }

    async fn enter(&self, name: &str) -> StoreResult<()> {
        {
            let mut in_flight = self.in_flight.lock();
            let count = in_flight.entry(name.to_string()).or_insert(0);
            *count += 1;
            self.max_overlap.fetch_max(*count, Ordering::SeqCst);
        }

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        match self.injected_failure() {
            Some(e) => {
                self.leave(name);
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn leave(&self, name: &str) {
        let mut in_flight = self.in_flight.lock();
        if let Some(count) = in_flight.get_mut(name) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl DraftStore for CountingStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Option<ExceptionDraft>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(name).await?;
        let result = self.inner.get(namespace, name).await;
        self.leave(name);
        result
    }

    async fn create(&self, draft: &ExceptionDraft) -> StoreResult<ExceptionDraft> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(&draft.metadata.name).await?;
        let result = self.inner.create(draft).await;
        self.leave(&draft.metadata.name);
        result
    }

    async fn patch(&self, draft: &ExceptionDraft) -> StoreResult<ExceptionDraft> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(&draft.metadata.name).await?;
        let result = self.inner.patch(draft).await;
        self.leave(&draft.metadata.name);
        result
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(name).await?;
        let result = self.inner.delete(namespace, name).await;
        self.leave(name);
        result
    }

    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<ExceptionDraft>> {
        self.inner.list(namespace).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn config() -> ReconcilerConfig {
    ReconcilerConfig::new(ACCEPTED_MODE)
        .with_target_categories([PSS_RESTRICTED])
        .with_target_workloads(["Deployment", "CronJob", "ScheduledBatch", "Pod"])
        .with_exclude_namespaces(["kube-system"])
}

pub fn reconciler_with(
    config: ReconcilerConfig,
    store: Arc<CountingStore>,
) -> (Reconciler, Arc<PolicyConfigCache>) {
    let cache = Arc::new(PolicyConfigCache::new());
    let reconciler = Reconciler::new(
        config,
        Arc::clone(&cache),
        Arc::new(FailureTracker::new()),
        store,
    );
    (reconciler, cache)
}

pub fn deployment(name: &str) -> ReportScope {
    ReportScope::new("Deployment", name, "default", format!("uid-{name}"))
}

pub fn cronjob(name: &str) -> ReportScope {
    ReportScope::new("CronJob", name, "default", format!("uid-cron-{name}"))
}

pub fn fail(policy: &str, rule: &str) -> ReportResult {
    ReportResult::new(policy, rule, PSS_RESTRICTED, ResultOutcome::Fail)
}

pub fn pass(policy: &str, rule: &str) -> ReportResult {
    ReportResult::new(policy, rule, PSS_RESTRICTED, ResultOutcome::Pass)
}

pub fn report(scope: ReportScope, results: Vec<ReportResult>) -> ReportEvent {
    ReportEvent::new(scope, results)
}

/// Opt-in log output for debugging a failing test (`RUST_LOG=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
