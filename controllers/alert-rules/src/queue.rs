//! Deduplicating, rate-limited work queue.
//!
//! One queue per watched workload kind. Guarantees:
//! - a key waiting in the queue appears at most once;
//! - a key is delivered to at most one consumer at a time; re-adding a key
//!   that is currently being processed merges into the in-flight item and
//!   re-delivers it exactly once after `done`;
//! - `retry` re-adds a failed key with per-key exponential backoff up to a
//!   fixed ceiling, after which the key is dropped and the failure reported
//!   to the sink. Retry policy lives here and nowhere else.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::backoff;
use crate::sink::AlertSink;

/// Retry ceiling: a key failing this many consecutive retries is dropped.
pub const MAX_RETRIES: u32 = 5;

#[derive(Default)]
struct State {
    /// Keys ready for delivery, each present at most once.
    ready: VecDeque<String>,
    /// Keys needing (re)processing, whether queued or in flight.
    dirty: HashSet<String>,
    /// Keys currently held by a consumer.
    processing: HashSet<String>,
    /// Consecutive retry count per key; cleared by `forget`.
    retries: HashMap<String, u32>,
    shutdown: bool,
}

/// Work queue keyed by `namespace/name` strings.
pub struct WorkQueue {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
    sink: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").field("name", &self.name).finish()
    }
}

impl WorkQueue {
    /// Creates a named queue reporting dropped keys to `sink`.
    pub fn new(name: &'static str, sink: Arc<dyn AlertSink>) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            sink,
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a key. No-op if the key is already queued; a key in flight
    /// is only marked dirty and re-queued when its consumer calls `done`.
    pub fn add(&self, key: &str) {
        let mut state = self.state();
        if state.shutdown || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if !state.processing.contains(key) {
            state.ready.push_back(key.to_string());
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Waits for the next key. Returns `None` once the queue has been shut
    /// down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a key as no longer in flight. If it was re-added while being
    /// processed, it is queued again for exactly one more delivery.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutdown {
            state.ready.push_back(key.to_string());
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Clears a key's retry history after a successful sync.
    pub fn forget(&self, key: &str) {
        self.state().retries.remove(key);
    }

    /// Re-queues a failed key with exponential backoff, or drops it once the
    /// retry ceiling is exceeded, reporting the drop to the sink.
    pub fn retry(self: &Arc<Self>, key: &str) {
        let attempt = {
            let mut state = self.state();
            if state.shutdown {
                return;
            }
            let count = state.retries.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if attempt > MAX_RETRIES {
            self.state().retries.remove(key);
            let message = format!(
                "dropping \"{key}\" out of the {} queue after {MAX_RETRIES} failed retries",
                self.name
            );
            warn!("{message}");
            self.sink.report(&message);
            return;
        }

        let delay = backoff::delay_for_attempt(attempt, backoff::BASE_DELAY, backoff::MAX_DELAY);
        debug!(queue = self.name, %key, attempt, ?delay, "requeueing with backoff");
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Consecutive retry count recorded for a key.
    pub fn retries(&self, key: &str) -> u32 {
        self.state().retries.get(key).copied().unwrap_or(0)
    }

    /// Stops accepting new keys. Already-queued keys are still delivered;
    /// `get` returns `None` once the queue is drained.
    pub fn shut_down(&self) {
        self.state().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting for delivery.
    pub fn len(&self) -> usize {
        self.state().ready.len()
    }

    /// Whether no keys are waiting for delivery.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
