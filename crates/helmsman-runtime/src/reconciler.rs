//! The reconcile loop shared by every controller.
//!
//! A [`Controller`] owns a work queue and a pool of workers. Each worker
//! pops a key, runs [`Reconciler::reconcile`] under a deadline, and feeds
//! the outcome back into the queue: success forgets the key's failure
//! history, errors are retried according to their [`ErrorClass`].

use crate::error::{Result, RuntimeError};
use crate::informer::Synced;
use crate::workqueue::WorkQueue;
use async_trait::async_trait;
use futures_util::FutureExt;
use helmsman_core::HelmsmanError;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do with a key after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

impl Action {
    pub fn requeue(after: Duration) -> Self {
        Action::RequeueAfter(after)
    }
}

/// How the loop retries an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with per-key backoff
    Transient,
    /// Optimistic concurrency lost; retry at once a few times, then back off
    Conflict,
    /// Retrying will not help; drop the key
    Permanent,
}

pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

impl Classify for HelmsmanError {
    fn classify(&self) -> ErrorClass {
        match self {
            HelmsmanError::Conflict { .. } => ErrorClass::Conflict,
            HelmsmanError::Invalid { .. }
            | HelmsmanError::Forbidden { .. }
            | HelmsmanError::SerializationError { .. } => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        }
    }
}

/// Level-triggered reconcile logic for one controller
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static;
    type Error: std::error::Error + Classify + Send + Sync + 'static;

    fn name(&self) -> &str;

    /// Drive the object named by `key` toward its desired state. Must be
    /// idempotent and must tolerate the object having vanished.
    async fn reconcile(&self, key: &Self::Key) -> std::result::Result<Action, Self::Error>;

    /// Called when a key is dropped after a permanent error
    async fn on_permanent_failure(&self, _key: &Self::Key, _error: &Self::Error) {}
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub cache_sync_timeout: Duration,
    /// Deadline for a single reconcile call
    pub reconcile_timeout: Duration,
    /// Immediate retries on conflict before falling back to backoff
    pub max_conflict_retries: u32,
    /// How often idle rate limiter state is dropped
    pub gc_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            cache_sync_timeout: Duration::from_secs(60),
            reconcile_timeout: Duration::from_secs(300),
            max_conflict_retries: 3,
            gc_interval: Duration::from_secs(600),
        }
    }
}

pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<R::Key>>,
    config: ControllerConfig,
    conflicts: Mutex<HashMap<R::Key, u32>>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, queue: Arc<WorkQueue<R::Key>>, config: ControllerConfig) -> Self {
        Self {
            reconciler,
            queue,
            config,
            conflicts: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<R::Key>> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<R> {
        &self.reconciler
    }

    /// Wait for the caches, run the workers until `token` is cancelled,
    /// then shut the queue down and wait for in-flight keys to finish
    pub async fn run(self: Arc<Self>, informers: Vec<Arc<dyn Synced>>, token: CancellationToken) -> Result<()> {
        let name = self.reconciler.name().to_string();
        info!("Starting {} controller", name);

        let synced = tokio::select! {
            _ = token.cancelled() => {
                self.queue.shut_down();
                return Ok(());
            }
            synced = wait_for_cache_sync(self.config.cache_sync_timeout, &informers) => synced,
        };
        if let Err(pending) = synced {
            error!("{} controller: caches did not sync: {}", name, pending);
            self.queue.shut_down();
            return Err(RuntimeError::cache_sync_timeout(self.config.cache_sync_timeout, pending));
        }

        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers.max(1) {
            let this = self.clone();
            workers.spawn(async move { while this.process_next().await {} });
        }

        let mut gc = tokio::time::interval(self.config.gc_interval);
        gc.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = gc.tick() => self.queue.gc(),
            }
        }

        info!("Shutting down {} controller", name);
        self.queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("{} worker exited abnormally: {}", name, e);
            }
        }
        info!("{} controller stopped", name);
        Ok(())
    }

    /// Process one key. Returns false once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let name = self.reconciler.name();
        let outcome = AssertUnwindSafe(tokio::time::timeout(
            self.config.reconcile_timeout,
            self.reconciler.reconcile(&key),
        ))
        .catch_unwind()
        .await;

        match outcome {
            Ok(Ok(Ok(action))) => self.handle_success(&key, action),
            Ok(Ok(Err(err))) => self.handle_error(&key, err).await,
            Ok(Err(_)) => {
                warn!(
                    "{}: reconcile of {} exceeded {:?}, retrying",
                    name, key, self.config.reconcile_timeout
                );
                self.queue.add_rate_limited(key.clone());
            }
            Err(panic) => {
                error!("{}: reconcile of {} panicked: {}", name, key, panic_message(&panic));
                self.queue.add_rate_limited(key.clone());
            }
        }

        self.queue.done(&key);
        true
    }

    fn handle_success(&self, key: &R::Key, action: Action) {
        self.conflicts.lock().remove(key);
        self.queue.forget(key);
        if let Action::RequeueAfter(after) = action {
            debug!("{}: requeue {} in {:?}", self.reconciler.name(), key, after);
            self.queue.add_after(key.clone(), after);
        }
    }

    async fn handle_error(&self, key: &R::Key, err: R::Error) {
        let name = self.reconciler.name();
        match err.classify() {
            ErrorClass::Conflict => {
                let attempts = {
                    let mut conflicts = self.conflicts.lock();
                    let n = conflicts.entry(key.clone()).or_insert(0);
                    *n += 1;
                    *n
                };
                if attempts <= self.config.max_conflict_retries {
                    debug!("{}: conflict on {} (attempt {}), retrying", name, key, attempts);
                    self.queue.add(key.clone());
                } else {
                    warn!("{}: repeated conflicts on {}: {}", name, key, err);
                    self.queue.add_rate_limited(key.clone());
                }
            }
            ErrorClass::Transient => {
                warn!(
                    "{}: error syncing {} (retry {}): {}",
                    name,
                    key,
                    self.queue.num_requeues(key),
                    err
                );
                self.queue.add_rate_limited(key.clone());
            }
            ErrorClass::Permanent => {
                error!("{}: dropping {} after permanent error: {}", name, key, err);
                self.conflicts.lock().remove(key);
                self.queue.forget(key);
                self.reconciler.on_permanent_failure(key, &err).await;
            }
        }
    }
}

/// Wait until every informer reports synced. On timeout returns the
/// names of the informers still pending.
pub async fn wait_for_cache_sync(
    timeout: Duration,
    informers: &[Arc<dyn Synced>],
) -> std::result::Result<(), String> {
    let all = async {
        for informer in informers {
            let mut rx = informer.synced_receiver();
            if rx.wait_for(|synced| *synced).await.is_err() {
                return false;
            }
        }
        true
    };

    match tokio::time::timeout(timeout, all).await {
        Ok(true) => Ok(()),
        _ => Err(informers
            .iter()
            .filter(|i| !i.has_synced())
            .map(|i| i.name())
            .collect::<Vec<_>>()
            .join(", ")),
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
