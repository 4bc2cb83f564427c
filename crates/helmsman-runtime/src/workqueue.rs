//! Deduplicating, rate-limited work queue.
//!
//! A key is in at most one of three places: queued (dirty, waiting for a
//! worker), processing (handed out by `get`, not yet `done`), or both
//! processing and dirty (re-added while a worker holds it). A key is never
//! handed to two workers at once.

use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub adds: u64,
    pub retries: u64,
    pub depth: usize,
    pub processing: usize,
    pub waiting: usize,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: BinaryHeap<Reverse<(Instant, u64)>>,
    waiting_keys: HashMap<u64, K>,
    deadlines: HashMap<K, (Instant, u64)>,
    seq: u64,
    shutting_down: bool,
    adds: u64,
    retries: u64,
}

impl<K: Clone + Eq + Hash> QueueState<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: BinaryHeap::new(),
            waiting_keys: HashMap::new(),
            deadlines: HashMap::new(),
            seq: 0,
            shutting_down: false,
            adds: 0,
            retries: 0,
        }
    }

    /// Returns true when a worker can now pick the key up
    fn insert(&mut self, key: K) -> bool {
        self.adds += 1;
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((at, seq))) = self.waiting.peek().copied() {
            if at > now {
                break;
            }
            self.waiting.pop();
            let Some(key) = self.waiting_keys.remove(&seq) else {
                continue;
            };
            if self.deadlines.get(&key).map(|(_, s)| *s) != Some(seq) {
                continue;
            }
            self.deadlines.remove(&key);
            self.insert(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|Reverse((at, _))| *at)
    }
}

/// Work queue keyed by `K`.
///
/// Handlers call [`WorkQueue::add`]; workers loop on [`WorkQueue::get`] and
/// must call [`WorkQueue::done`] when finished with the key.
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    rate_limiter: Arc<dyn RateLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Queue using the default controller rate limiter
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, Arc::new(default_controller_rate_limiter()))
    }

    pub fn with_rate_limiter(name: impl Into<String>, rate_limiter: Arc<dyn RateLimiter<K>>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark `key` as needing work. No-op if it is already queued.
    pub fn add(&self, key: K) {
        let wake = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.insert(key)
        };
        if wake {
            self.notify.notify_waiters();
        }
    }

    /// Add `key` once `delay` has elapsed. A pending delayed add for the
    /// same key keeps whichever deadline is earlier.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let at = Instant::now()
            .checked_add(delay)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86400 * 365));
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            if let Some((existing, _)) = state.deadlines.get(&key) {
                if *existing <= at {
                    return;
                }
            }
            state.seq += 1;
            let seq = state.seq;
            if let Some((_, old_seq)) = state.deadlines.insert(key.clone(), (at, seq)) {
                state.waiting_keys.remove(&old_seq);
            }
            state.waiting_keys.insert(seq, key);
            state.waiting.push(Reverse((at, seq)));
        }
        // Sleeping workers recompute their wake-up time
        self.notify.notify_waiters();
    }

    /// Add `key` after the delay its rate limiter assigns
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.rate_limiter.when(&key);
        self.state.lock().retries += 1;
        debug!("{}: requeue {:?} in {:?}", self.name, key, delay);
        self.add_after(key, delay);
    }

    /// Clear the rate limiter's failure history for `key`
    pub fn forget(&self, key: &K) {
        self.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Drop stale rate limiter state
    pub fn gc(&self) {
        self.rate_limiter.gc();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down
    /// and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock();
                if !state.shutting_down {
                    state.promote_due(Instant::now());
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after processing. If it was re-added meanwhile it is
    /// queued again.
    pub fn done(&self, key: &K) {
        let wake = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if wake {
            self.notify.notify_waiters();
        }
    }

    /// Stop accepting keys. Workers drain what is queued, then `get`
    /// returns `None`. Delayed adds are dropped.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
            state.waiting_keys.clear();
            state.deadlines.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys ready for a worker right now
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> QueueMetrics {
        let state = self.state.lock();
        QueueMetrics {
            adds: state.adds,
            retries: state.retries,
            depth: state.queue.len(),
            processing: state.processing.len(),
            waiting: state.deadlines.len(),
        }
    }
}
