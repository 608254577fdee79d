//! Keyed, deduplicating, rate-limited work queue.
//!
//! ## Semantics
//!
//! - A key added while already queued is collapsed into the queued entry.
//! - A key added while being processed is marked dirty and requeued when
//!   its worker calls [`WorkQueue::done`]; the queue therefore guarantees
//!   a key is in flight on at most one worker at a time.
//! - [`WorkQueue::add_rate_limited`] applies per-key exponential backoff;
//!   after `max_retries` failures the caller is expected to
//!   [`WorkQueue::forget`] the key and surface the error.
//!
//! Workers block on [`WorkQueue::get`] until a key or shutdown arrives.
//! The queue is a cheap-clone handle; clones share the same state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Retries before a failing key is dropped with a warning.
pub const MAX_RETRIES: u32 = 3;

const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Default)]
struct QueueInner {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    retries: HashMap<String, u32>,
    shutting_down: bool,
}

struct Shared {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

/// Work queue driving one controller's reconcilers.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(QueueInner::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a key, deduplicating against queued and in-flight work.
    pub fn add(&self, key: &str) {
        let mut inner = self.shared.inner.lock();
        if inner.shutting_down || inner.dirty.contains(key) {
            return;
        }
        inner.dirty.insert(key.to_string());
        if inner.processing.contains(key) {
            // Requeued by done() once the in-flight pass finishes.
            return;
        }
        inner.queue.push_back(key.to_string());
        drop(inner);
        self.shared.notify.notify_one();
    }

    /// Enqueue after `delay` without holding a worker.
    pub fn add_after(&self, key: &str, delay: Duration) {
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Enqueue with exponential backoff based on the key's failure count.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut inner = self.shared.inner.lock();
            let retries = inner.retries.entry(key.to_string()).or_insert(0);
            *retries += 1;
            backoff(*retries)
        };
        self.add_after(key, delay);
    }

    /// Failure count accumulated by [`WorkQueue::add_rate_limited`].
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.shared.inner.lock().retries.get(key).copied().unwrap_or(0)
    }

    /// Clear the failure count after success or final drop.
    pub fn forget(&self, key: &str) {
        self.shared.inner.lock().retries.remove(key);
    }

    /// Block until a key is available. Returns `None` on shutdown.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Mark a key's pass finished; requeues it if it went dirty meanwhile.
    pub fn done(&self, key: &str) {
        let mut inner = self.shared.inner.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.shared.notify.notify_one();
        }
    }

    /// Drain: workers finish in-flight keys, then `get` returns `None`.
    pub fn shut_down(&self) {
        self.shared.inner.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff(retries: u32) -> Duration {
    let exp = retries.saturating_sub(1).min(16);
    let delay = BASE_DELAY.saturating_mul(1u32 << exp);
    delay.min(MAX_DELAY)
}

// ════════════════════════════════════════════════════════════════════════════
// CACHE-SYNC GATE
// ════════════════════════════════════════════════════════════════════════════

/// Barrier holding workers until every subscribed cache has primed.
pub struct CacheSyncGate {
    tx: tokio::sync::watch::Sender<bool>,
}

impl Default for CacheSyncGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheSyncGate {
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::watch::channel(false);
        Self { tx }
    }

    pub fn mark_synced(&self) {
        let _ = self.tx.send(true);
    }

    pub async fn wait_synced(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
