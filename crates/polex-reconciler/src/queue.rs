//! De-duplicating work queue keyed by resource.
//!
//! A key is queued at most once. A key added while a worker holds it is
//! marked dirty and handed out again only after [`WorkQueue::done`], so no
//! two workers ever reconcile the same key concurrently.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::model::ResourceKey;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ResourceKey>,
    dirty: HashSet<ResourceKey>,
    processing: HashSet<ResourceKey>,
    shutting_down: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.processing.is_empty()
    }
}

/// Work queue shared by the controller workers.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    available: Notify,
    idle: Notify,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key`. Returns false if it was already pending or the queue is
    /// shutting down.
    pub fn add(&self, key: ResourceKey) -> bool {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return false;
        }
        state.dirty.insert(key.clone());
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.available.notify_one();
        }
        true
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing, re-queueing it if it was added meanwhile.
    pub fn done(&self, key: &ResourceKey) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.available.notify_one();
            return;
        }
        let idle = state.is_idle();
        drop(state);
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.available.notify_waiters();
        self.idle.notify_waiters();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Resolve once nothing is queued or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.is_idle() || state.shutting_down {
                    return;
                }
            }

            notified.await;
        }
    }

    /// Number of keys waiting to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    #[must_use]
    pub fn is_processing(&self, key: &ResourceKey) -> bool {
        self.state.lock().processing.contains(key)
    }
}
