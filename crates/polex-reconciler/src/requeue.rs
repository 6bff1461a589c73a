//! Jittered re-delivery of resource keys.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::ResourceKey;
use crate::queue::WorkQueue;

/// `base` spread uniformly by +/- `max_jitter_percent` (clamped to 100).
#[must_use]
pub fn jittered_delay(base: Duration, max_jitter_percent: u32) -> Duration {
    let percent = max_jitter_percent.min(100);
    if percent == 0 || base.is_zero() {
        return base;
    }
    let spread = f64::from(percent) / 100.0;
    let factor = rand::thread_rng().gen_range(-spread..=spread);
    base.mul_f64(1.0 + factor)
}

/// Re-enqueues keys into a [`WorkQueue`] after a jittered delay.
///
/// A key with a pending timer is not scheduled again until that timer fires.
#[derive(Debug, Clone)]
pub struct RequeueScheduler {
    queue: Arc<WorkQueue>,
    pending: Arc<DashSet<ResourceKey>>,
    cancel: CancellationToken,
}

impl RequeueScheduler {
    pub fn new(queue: Arc<WorkQueue>, cancel: CancellationToken) -> Self {
        Self {
            queue,
            pending: Arc::new(DashSet::new()),
            cancel,
        }
    }

    /// Schedule `key` for re-delivery.
    ///
    /// Returns the effective delay, or `None` if a timer is already pending.
    pub fn schedule(
        &self,
        key: ResourceKey,
        base: Duration,
        max_jitter_percent: u32,
    ) -> Option<Duration> {
        if !self.pending.insert(key.clone()) {
            return None;
        }

        let delay = jittered_delay(base, max_jitter_percent);
        debug!(
            key = %key,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Requeue scheduled"
        );

        let queue = Arc::clone(&self.queue);
        let pending = Arc::clone(&self.pending);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    pending.remove(&key);
                }
                () = tokio::time::sleep(delay) => {
                    pending.remove(&key);
                    queue.add(key);
                }
            }
        });

        Some(delay)
    }

    #[must_use]
    pub fn is_pending(&self, key: &ResourceKey) -> bool {
        self.pending.contains(key)
    }

    /// Number of keys waiting on a timer.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
