//! Report controller.
//!
//! Owns the worker pool that drains the [`WorkQueue`]. Producers call
//! [`ReportController::submit`] for report events and
//! [`ReportController::apply_manifest`] for policy manifest events; only the
//! latest report per resource key is kept, so a burst of deliveries for one
//! resource collapses into a single reconcile.
//!
//! Manifest events also converge the drafts a manifest declares. Those syncs
//! run one at a time and are repeated by the reconfirmation pass, which is how
//! a sync that hit a transient store error eventually lands.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{DraftAction, Reconciler};
use crate::error::{ReconcileError, ReconcileResult};
use crate::manifest::{apply_manifest_event, ManifestEvent};
use crate::model::{PolicyManifest, ReportEvent, ResourceKey};
use crate::queue::WorkQueue;
use crate::requeue::{jittered_delay, RequeueScheduler};
use crate::stats::{ReconcileStats, StatsSnapshot};

/// Worker pool driving a [`Reconciler`].
pub struct ReportController {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    scheduler: RequeueScheduler,
    events: DashMap<ResourceKey, ReportEvent>,
    deferred: DashSet<ResourceKey>,
    /// Latest applied manifest per policy. `None` marks a deleted manifest
    /// whose declared drafts are not yet withdrawn.
    manifests: DashMap<String, Option<PolicyManifest>>,
    manifest_sync: tokio::sync::Mutex<()>,
    stats: ReconcileStats,
    shutdown: CancellationToken,
    fatal: Mutex<Option<ReconcileError>>,
}

impl ReportController {
    pub fn new(reconciler: Reconciler) -> Arc<Self> {
        let queue = Arc::new(WorkQueue::new());
        let shutdown = CancellationToken::new();
        Arc::new(Self {
            reconciler: Arc::new(reconciler),
            scheduler: RequeueScheduler::new(Arc::clone(&queue), shutdown.clone()),
            queue,
            events: DashMap::new(),
            deferred: DashSet::new(),
            manifests: DashMap::new(),
            manifest_sync: tokio::sync::Mutex::new(()),
            stats: ReconcileStats::new(),
            shutdown,
            fatal: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Accept a report event, replacing any queued event for the same resource.
    pub fn submit(&self, event: ReportEvent) -> ReconcileResult<ResourceKey> {
        let key = match event.resource_key() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Dropping malformed report");
                self.stats.record_dropped();
                return Err(e);
            }
        };

        self.events.insert(key.clone(), event);
        if !self.queue.add(key.clone()) {
            debug!(key = %key, "Key already queued");
        }
        Ok(key)
    }

    /// Apply a policy manifest event to the configuration cache, then converge
    /// the drafts the manifest declares.
    ///
    /// Keys deferred on an unknown policy mode are queued again right away.
    pub async fn apply_manifest(&self, event: &ManifestEvent) -> ReconcileResult<()> {
        if let Err(e) = apply_manifest_event(self.reconciler.cache(), event) {
            warn!(error = %e, "Dropping malformed policy manifest");
            self.stats.record_dropped();
            return Err(e);
        }

        match event {
            ManifestEvent::Applied(manifest) => {
                let waiting: Vec<ResourceKey> =
                    self.deferred.iter().map(|k| k.key().clone()).collect();
                if !waiting.is_empty() {
                    debug!(count = waiting.len(), "Retrying deferred keys");
                }
                for key in waiting {
                    self.queue.add(key);
                }
                self.manifests
                    .insert(manifest.name.clone(), Some(manifest.clone()));
            }
            ManifestEvent::Deleted { name } => {
                self.manifests.insert(name.clone(), None);
            }
        }

        self.sync_manifest(event.policy_id()).await
    }

    /// Resolve once no key is queued or being reconciled.
    ///
    /// Keys waiting on a requeue timer do not count.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    /// Request shutdown. In-flight reconciles finish first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the workers until `cancel` fires or a fatal error occurs.
    ///
    /// Returns the fatal error, if one stopped the controller. A configuration
    /// that fails [`ReconcilerConfig::validate`] is refused before any worker
    /// starts.
    ///
    /// [`ReconcilerConfig::validate`]: crate::config::ReconcilerConfig::validate
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> ReconcileResult<()> {
        let config = self.reconciler.config();
        if let Err(e) = config.validate() {
            error!(error = %e, "Refusing to start with invalid configuration");
            return Err(e.into());
        }
        info!(
            workers = config.worker_concurrency,
            requeue_interval_ms = config.requeue_interval_ms,
            reconfirm_interval_secs = config.reconfirm_interval_secs,
            "Starting report controller"
        );

        let workers: Vec<_> = (0..config.worker_concurrency)
            .map(|id| {
                let controller = Arc::clone(&self);
                tokio::spawn(async move { controller.worker(id).await })
            })
            .collect();

        let ticker = config.reconfirm_interval().map(|interval| {
            let controller = Arc::clone(&self);
            tokio::spawn(async move { controller.reconfirm_loop(interval).await })
        });

        tokio::select! {
            () = cancel.cancelled() => info!("Cancellation requested, stopping controller"),
            () = self.shutdown.cancelled() => {}
        }
        self.shutdown.cancel();
        self.queue.shutdown();

        info!("Waiting for in-flight reconciles to complete...");
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }

        let stats = self.stats.snapshot();
        info!(
            reconciled = stats.reconciled,
            writes = stats.writes(),
            failed = stats.failed,
            "Report controller stopped"
        );

        let fatal = self.fatal.lock().take();
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn worker(&self, id: usize) {
        debug!(worker = id, "Worker started");
        while let Some(key) = self.queue.next().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = id, "Worker stopped");
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn process(&self, key: &ResourceKey) {
        let Some(event) = self.events.get(key).map(|e| e.value().clone()) else {
            return;
        };

        match self.reconciler.reconcile(&event).await {
            Ok(outcome) => {
                self.stats.record_action(outcome.action);
                if outcome.requeue {
                    self.deferred.insert(key.clone());
                    self.requeue(key);
                    return;
                }
                self.deferred.remove(key);
                if event.deletion_requested || outcome.action == DraftAction::Skipped {
                    // A newer event for the same key may have arrived meanwhile.
                    self.events.remove_if(key, |_, latest| *latest == event);
                }
            }
            Err(e) if e.is_malformed() => {
                warn!(error = %e, "Dropping malformed report");
                self.stats.record_dropped();
                self.events.remove_if(key, |_, latest| *latest == event);
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Fatal store error, stopping controller");
                self.stats.record_failure();
                self.fatal.lock().get_or_insert(e);
                self.shutdown.cancel();
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(error = %e, "Reconcile failed, will retry");
                } else {
                    error!(error = %e, "Reconcile failed");
                }
                self.stats.record_failure();
                self.requeue(key);
            }
        }
    }

    /// Converge the declared drafts of one policy to its latest manifest.
    #[instrument(skip(self))]
    async fn sync_manifest(&self, policy: &str) -> ReconcileResult<()> {
        let _serial = self.manifest_sync.lock().await;
        let Some(latest) = self.manifests.get(policy).map(|m| m.value().clone()) else {
            return Ok(());
        };

        let result = match &latest {
            Some(manifest) => self.reconciler.reconcile_manifest(manifest).await,
            None => self.reconciler.withdraw_manifest(policy).await,
        };

        match result {
            Ok(outcome) => {
                for action in outcome.drafts.values() {
                    self.stats.record_action(*action);
                }
                if latest.is_none() {
                    self.manifests.remove_if(policy, |_, m| m.is_none());
                }
                Ok(())
            }
            Err(e) if e.is_malformed() => {
                warn!(error = %e, "Declared exceptions rejected");
                self.stats.record_dropped();
                self.manifests.remove_if(policy, |_, m| *m == latest);
                Err(e)
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Fatal store error, stopping controller");
                self.stats.record_failure();
                self.fatal.lock().get_or_insert(e.clone());
                self.shutdown.cancel();
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Declared exception sync failed, retried on reconfirmation");
                self.stats.record_failure();
                Err(e)
            }
        }
    }

    fn requeue(&self, key: &ResourceKey) {
        let config = self.reconciler.config();
        if self
            .scheduler
            .schedule(
                key.clone(),
                config.requeue_interval(),
                config.max_jitter_percent,
            )
            .is_some()
        {
            self.stats.record_requeue();
        }
    }

    /// Periodically queue every known key so the store converges even if a
    /// write was lost.
    async fn reconfirm_loop(&self, interval: std::time::Duration) {
        let jitter = self.reconciler.config().max_jitter_percent;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(jittered_delay(interval, jitter)) => {
                    let keys: Vec<ResourceKey> =
                        self.events.iter().map(|e| e.key().clone()).collect();
                    debug!(count = keys.len(), "Reconfirming known keys");
                    for key in keys {
                        self.queue.add(key);
                    }

                    let policies: Vec<String> =
                        self.manifests.iter().map(|m| m.key().clone()).collect();
                    for policy in policies {
                        // Failures are logged and counted inside.
                        let _ = self.sync_manifest(&policy).await;
                    }
                }
            }
        }
    }
}
