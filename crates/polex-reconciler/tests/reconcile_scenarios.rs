//! Reconciliation Engine Scenarios
//!
//! End-to-end behavior of `Reconciler::reconcile` against a counting store:
//! - Draft creation, update and deletion
//! - Idempotence and unordered policy comparison
//! - Deferral on unknown policy configuration
//! - Filtering and malformed input
//! - Kind expansion and store timeouts

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use polex_reconciler::model::RESOURCE_KIND_LABEL;
use polex_reconciler::{
    DraftAction, DraftStore, ExceptionDraft, KindExpansion, ReconcileError, ReportEvent,
    ReportResult, ReportScope, ResultOutcome, StoreError,
};

fn policies(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_failing_deployment_creates_draft() {
    init_tracing();
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("require-run-as-nonroot", ACCEPTED_MODE);

    let outcome = reconciler
        .reconcile(&report(
            deployment("app-deployment"),
            vec![fail("require-run-as-nonroot", "run-as-nonroot")],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.action, DraftAction::Created);
    assert_eq!(outcome.policies, policies(&["require-run-as-nonroot"]));

    let draft = store.peek("default", "app-deployment-deployment").unwrap();
    assert_eq!(draft.spec.policies, vec!["require-run-as-nonroot"]);
    assert!(draft.is_managed());
    assert_eq!(
        draft.metadata.labels.get(RESOURCE_KIND_LABEL).map(String::as_str),
        Some("Deployment")
    );

    let target = draft.primary_target().unwrap();
    assert!(target.kinds.contains(&"Deployment".to_string()));
    assert!(target.kinds.contains(&"Pod".to_string()));
    assert_eq!(target.names, vec!["app-deployment*"]);
}

#[tokio::test]
async fn test_pass_deletes_draft() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("require-run-as-nonroot", ACCEPTED_MODE);

    reconciler
        .reconcile(&report(
            deployment("app-deployment"),
            vec![fail("require-run-as-nonroot", "run-as-nonroot")],
        ))
        .await
        .unwrap();

    let outcome = reconciler
        .reconcile(&report(
            deployment("app-deployment"),
            vec![pass("require-run-as-nonroot", "run-as-nonroot")],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.action, DraftAction::Deleted);
    assert!(outcome.policies.is_empty());
    assert!(store.peek("default", "app-deployment-deployment").is_none());
    assert!(reconciler.tracker().is_empty());
}

#[tokio::test]
async fn test_resource_deletion_removes_draft_and_state() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("disallow-privileged", ACCEPTED_MODE);

    let event = report(
        deployment("web"),
        vec![fail("disallow-privileged", "privileged-containers")],
    );
    reconciler.reconcile(&event).await.unwrap();
    assert_eq!(reconciler.tracker().len(), 1);

    let outcome = reconciler.reconcile(&event.deleted()).await.unwrap();
    assert_eq!(outcome.action, DraftAction::Deleted);
    assert!(reconciler.tracker().is_empty());
    assert!(store.snapshot().is_empty());
}

#[tokio::test]
async fn test_second_policy_patches_draft() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("disallow-privileged", ACCEPTED_MODE);
    cache.put("require-run-as-nonroot", ACCEPTED_MODE);

    reconciler
        .reconcile(&report(
            deployment("web"),
            vec![fail("disallow-privileged", "privileged-containers")],
        ))
        .await
        .unwrap();
    let created = store.peek("default", "web-deployment").unwrap();

    let outcome = reconciler
        .reconcile(&report(
            deployment("web"),
            vec![
                fail("disallow-privileged", "privileged-containers"),
                fail("require-run-as-nonroot", "run-as-nonroot"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.action, DraftAction::Patched);
    let patched = store.peek("default", "web-deployment").unwrap();
    assert_eq!(
        patched.spec.policies,
        vec!["disallow-privileged", "require-run-as-nonroot"]
    );
    assert_eq!(patched.metadata.uid, created.metadata.uid);
    assert_eq!(store.create_calls(), 1);
    assert_eq!(store.patch_calls(), 1);
}

#[tokio::test]
async fn test_draft_kept_while_any_rule_fails() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("disallow-capabilities", ACCEPTED_MODE);

    reconciler
        .reconcile(&report(
            deployment("web"),
            vec![
                fail("disallow-capabilities", "adding-capabilities"),
                fail("disallow-capabilities", "drop-all"),
            ],
        ))
        .await
        .unwrap();

    let outcome = reconciler
        .reconcile(&report(
            deployment("web"),
            vec![pass("disallow-capabilities", "adding-capabilities")],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.action, DraftAction::Unchanged);
    assert!(store.peek("default", "web-deployment").is_some());
    assert_eq!(
        reconciler
            .tracker()
            .rules(&deployment("web").key(), "disallow-capabilities"),
        policies(&["drop-all"])
    );
}

#[tokio::test]
async fn test_kinds_sharing_a_name_keep_separate_drafts() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("p1", ACCEPTED_MODE);
    cache.put("p2", ACCEPTED_MODE);

    reconciler
        .reconcile(&report(deployment("web"), vec![fail("p1", "r")]))
        .await
        .unwrap();
    let outcome = reconciler
        .reconcile(&report(cronjob("web"), vec![fail("p2", "r")]))
        .await
        .unwrap();
    assert_eq!(outcome.policies, policies(&["p2"]));

    let cron_draft = store.peek("default", "web-cronjob").unwrap();
    assert_eq!(cron_draft.spec.policies, vec!["p2"]);
    assert_eq!(reconciler.tracker().len(), 2);

    // Clearing the CronJob must leave the Deployment's draft alone.
    let outcome = reconciler
        .reconcile(&report(cronjob("web"), vec![pass("p1", "r"), pass("p2", "r")]))
        .await
        .unwrap();
    assert_eq!(outcome.action, DraftAction::Deleted);
    assert!(store.peek("default", "web-cronjob").is_none());

    let deploy_draft = store.peek("default", "web-deployment").unwrap();
    assert_eq!(deploy_draft.spec.policies, vec!["p1"]);
    assert_eq!(
        reconciler.tracker().policies(&deployment("web").key()),
        policies(&["p1"])
    );
    assert!(reconciler.tracker().policies(&cronjob("web").key()).is_empty());

    // And clearing the Deployment removes the last draft.
    reconciler
        .reconcile(&report(deployment("web"), vec![pass("p1", "r")]))
        .await
        .unwrap();
    assert!(store.snapshot().is_empty());
    assert!(reconciler.tracker().is_empty());
}

// =============================================================================
// Idempotence and dedup
// =============================================================================

#[tokio::test]
async fn test_identical_event_twice_writes_once() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("disallow-privileged", ACCEPTED_MODE);

    let event = report(
        deployment("web"),
        vec![fail("disallow-privileged", "privileged-containers")],
    );
    let first = reconciler.reconcile(&event).await.unwrap();
    let second = reconciler.reconcile(&event).await.unwrap();

    assert_eq!(first.action, DraftAction::Created);
    assert_eq!(second.action, DraftAction::Unchanged);
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn test_policy_order_does_not_trigger_write() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));

    // Seed a draft listing ["b", "a"] directly.
    let mut seeded = ExceptionDraft::for_resource(
        &deployment("web"),
        "default",
        &policies(&["a", "b"]),
        KindExpansion::default().expand("Deployment"),
    );
    seeded.spec.policies = vec!["b".to_string(), "a".to_string()];
    store.create(&seeded).await.unwrap();
    let writes_before = store.writes();

    cache.put("a", ACCEPTED_MODE);
    cache.put("b", ACCEPTED_MODE);
    let outcome = reconciler
        .reconcile(&report(
            deployment("web"),
            vec![fail("a", "r1"), fail("b", "r1")],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.action, DraftAction::Unchanged);
    assert_eq!(store.writes(), writes_before);
}

#[tokio::test]
async fn test_stored_draft_without_target_is_repaired() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("a", ACCEPTED_MODE);

    let mut broken = ExceptionDraft::for_resource(
        &deployment("web"),
        "default",
        &policies(&["a"]),
        vec![],
    );
    broken.spec.targets.clear();
    store.create(&broken).await.unwrap();

    let outcome = reconciler
        .reconcile(&report(deployment("web"), vec![fail("a", "r1")]))
        .await
        .unwrap();

    assert_eq!(outcome.action, DraftAction::Patched);
    let repaired = store.peek("default", "web-deployment").unwrap();
    assert!(repaired.primary_target().is_ok());
}

// =============================================================================
// Policy configuration
// =============================================================================

#[tokio::test]
async fn test_unknown_policy_defers_without_store_call() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, _cache) = reconciler_with(config(), Arc::clone(&store));

    let outcome = reconciler
        .reconcile(&report(
            deployment("web"),
            vec![fail("not-yet-cached", "rule")],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.action, DraftAction::Deferred);
    assert!(outcome.requeue);
    assert_eq!(store.calls(), 0);
}

#[tokio::test]
async fn test_deferred_event_converges_once_mode_known() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("known", ACCEPTED_MODE);

    let event = report(
        deployment("web"),
        vec![fail("known", "r1"), fail("late", "r2")],
    );
    let outcome = reconciler.reconcile(&event).await.unwrap();
    assert_eq!(outcome.action, DraftAction::Deferred);
    // Known results are still tracked.
    assert_eq!(outcome.policies, policies(&["known"]));
    assert_eq!(store.calls(), 0);

    cache.put("late", ACCEPTED_MODE);
    let outcome = reconciler.reconcile(&event).await.unwrap();
    assert_eq!(outcome.action, DraftAction::Created);
    assert_eq!(
        store.peek("default", "web-deployment").unwrap().spec.policies,
        vec!["known", "late"]
    );
}

#[tokio::test]
async fn test_policy_leaving_accepted_mode_removes_draft() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("disallow-privileged", ACCEPTED_MODE);

    let event = report(
        deployment("web"),
        vec![fail("disallow-privileged", "privileged-containers")],
    );
    reconciler.reconcile(&event).await.unwrap();

    cache.put("disallow-privileged", "enforce");
    let outcome = reconciler.reconcile(&event).await.unwrap();
    assert_eq!(outcome.action, DraftAction::Deleted);
    assert!(store.snapshot().is_empty());
}

#[tokio::test]
async fn test_warn_and_error_results_are_ignored() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("p", ACCEPTED_MODE);

    let outcome = reconciler
        .reconcile(&report(
            deployment("web"),
            vec![
                ReportResult::new("p", "r1", PSS_RESTRICTED, ResultOutcome::Warn),
                ReportResult::new("unknown", "r1", PSS_RESTRICTED, ResultOutcome::Error),
                ReportResult::new("p", "r2", PSS_RESTRICTED, ResultOutcome::Skip),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.action, DraftAction::Absent);
    assert!(reconciler.tracker().is_empty());
}

// =============================================================================
// Convergence
// =============================================================================

#[tokio::test]
async fn test_event_sequence_converges_to_failing_set() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    for p in ["p1", "p2", "p3"] {
        cache.put(p, ACCEPTED_MODE);
    }

    let sequence = vec![
        vec![fail("p1", "r")],
        vec![fail("p1", "r"), fail("p2", "r")],
        vec![fail("p1", "r"), fail("p1", "r")],
        vec![pass("p1", "r"), fail("p3", "r")],
        vec![fail("p2", "r")],
        vec![pass("p3", "r")],
    ];
    for results in sequence {
        reconciler
            .reconcile(&report(deployment("web"), results))
            .await
            .unwrap();
    }

    let tracked = reconciler.tracker().policies(&deployment("web").key());
    assert_eq!(tracked, policies(&["p2"]));
    let drafts = store.snapshot();
    assert_eq!(drafts.len(), 1);
    assert!(drafts[0].has_policies(&tracked));

    reconciler
        .reconcile(&report(deployment("web"), vec![pass("p2", "r")]))
        .await
        .unwrap();
    assert!(store.snapshot().is_empty());
}

// =============================================================================
// Filtering and malformed input
// =============================================================================

#[tokio::test]
async fn test_excluded_namespace_makes_no_calls() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("p", ACCEPTED_MODE);

    let outcome = reconciler
        .reconcile(&report(
            ReportScope::new("Deployment", "coredns", "kube-system", "u"),
            vec![fail("p", "r")],
        ))
        .await
        .unwrap();

    assert_eq!(outcome.action, DraftAction::Skipped);
    assert_eq!(store.calls(), 0);
}

#[tokio::test]
async fn test_missing_scope_is_malformed() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, _) = reconciler_with(config(), Arc::clone(&store));

    let event = ReportEvent {
        scope: None,
        results: vec![fail("p", "r")],
        deletion_requested: false,
    };
    let err = reconciler.reconcile(&event).await.unwrap_err();

    assert!(matches!(err, ReconcileError::MalformedReport { field: "scope" }));
    assert_eq!(store.calls(), 0);
}

// =============================================================================
// Kind expansion
// =============================================================================

#[tokio::test]
async fn test_cronjob_draft_covers_jobs() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("p", ACCEPTED_MODE);

    reconciler
        .reconcile(&report(
            ReportScope::new("CronJob", "nightly", "default", "u"),
            vec![fail("p", "r")],
        ))
        .await
        .unwrap();

    let draft = store.peek("default", "nightly-cronjob").unwrap();
    assert_eq!(
        draft.primary_target().unwrap().kinds,
        vec!["CronJob", "Job", "Pod"]
    );
}

#[tokio::test]
async fn test_custom_job_spawning_kind() {
    let store = Arc::new(CountingStore::new());
    let table = KindExpansion::default().with_child("ScheduledBatch", "SpawnedJob");
    let (reconciler, cache) =
        reconciler_with(config().with_kind_expansion(table), Arc::clone(&store));
    cache.put("p", ACCEPTED_MODE);

    reconciler
        .reconcile(&report(
            ReportScope::new("ScheduledBatch", "etl", "default", "u"),
            vec![fail("p", "r")],
        ))
        .await
        .unwrap();
    reconciler
        .reconcile(&report(
            ReportScope::new("Pod", "debug", "default", "u"),
            vec![fail("p", "r")],
        ))
        .await
        .unwrap();

    let batch = store.peek("default", "etl-scheduledbatch").unwrap();
    assert_eq!(
        batch.primary_target().unwrap().kinds,
        vec!["ScheduledBatch", "SpawnedJob", "Pod"]
    );
    let pod = store.peek("default", "debug-pod").unwrap();
    assert_eq!(pod.primary_target().unwrap().kinds, vec!["Pod"]);
}

// =============================================================================
// Store failures
// =============================================================================

#[tokio::test]
async fn test_slow_store_times_out_as_transient() {
    let store = Arc::new(CountingStore::new().with_latency(Duration::from_millis(200)));
    let (reconciler, cache) = reconciler_with(
        config().with_store_timeout(Duration::from_millis(20)),
        Arc::clone(&store),
    );
    cache.put("p", ACCEPTED_MODE);

    let err = reconciler
        .reconcile(&report(deployment("web"), vec![fail("p", "r")]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::Store(StoreError::Timeout { timeout_ms: 20 })
    ));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_unauthorized_store_is_fatal() {
    let store = Arc::new(CountingStore::new());
    let (reconciler, cache) = reconciler_with(config(), Arc::clone(&store));
    cache.put("p", ACCEPTED_MODE);
    store.fail_next(MockFailure::Unauthorized, 1);

    let err = reconciler
        .reconcile(&report(deployment("web"), vec![fail("p", "r")]))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
}
