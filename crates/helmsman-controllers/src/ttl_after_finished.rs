//! TTL-after-finished controller.
//!
//! Deletes finished Jobs and Pods once their TTL has run out. Jobs carry the
//! TTL in `spec.ttlSecondsAfterFinished`; Pods carry it in the
//! [`ANNOTATION_POD_TTL`] annotation. Before deleting, the object is read
//! back from storage and the expiry recomputed, and the delete is bound to
//! the fresh uid.

use crate::config::CONTROLLER_TTL_AFTER_FINISHED;
use crate::context::{synced, ControllerContext};
use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helmsman_core::resources::pod;
use helmsman_core::{EventType, Job, ObjectKey, Pod, Resource};
use helmsman_runtime::{Action, CancellationToken, Controller, EventHandlerFns, Reconciler, WorkQueue};
use helmsman_storage::{DeleteOptions, PropagationPolicy};
use k8s_openapi::api::core::v1::ObjectReference;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Seconds after a pod finishes before it is deleted
pub const ANNOTATION_POD_TTL: &str = "helmsman.io/ttl-seconds-after-finished";

pub const REASON_TTL_DELETED: &str = "TTLDeleted";
pub const REASON_TTL_SKEW_DETECTED: &str = "TTLSkewDetected";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TtlKey {
    Job(ObjectKey),
    Pod(ObjectKey),
}

impl fmt::Display for TtlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TtlKey::Job(key) => write!(f, "job/{}", key),
            TtlKey::Pod(key) => write!(f, "pod/{}", key),
        }
    }
}

/// Finish time and TTL of an object due for cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub finished_at: DateTime<Utc>,
    pub ttl: chrono::Duration,
}

impl Expiry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.finished_at + self.ttl
    }
}

/// Kinds the controller cleans up
pub trait Expiring: Resource {
    fn ttl_seconds(&self) -> Option<i64>;
    fn is_finished(&self) -> bool;
    fn finished_at(&self) -> Option<DateTime<Utc>>;

    fn needs_cleanup(&self) -> bool {
        !self.is_terminating() && self.ttl_seconds().is_some() && self.is_finished()
    }

    /// `Ok(None)` when no cleanup is due; an error when the object is
    /// finished but its finish time cannot be determined
    fn expiry(&self) -> Result<Option<Expiry>> {
        if !self.needs_cleanup() {
            return Ok(None);
        }
        let ttl = self.ttl_seconds().unwrap_or_default().max(0);
        let finished_at = self
            .finished_at()
            .ok_or_else(|| ControllerError::missing_finish_time(self.object_key().to_string()))?;
        Ok(Some(Expiry {
            finished_at,
            ttl: chrono::Duration::seconds(ttl),
        }))
    }
}

fn finishing_condition(job: &Job) -> Option<&k8s_openapi::api::batch::v1::JobCondition> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
}

impl Expiring for Job {
    fn ttl_seconds(&self) -> Option<i64> {
        self.spec
            .as_ref()
            .and_then(|s| s.ttl_seconds_after_finished)
            .map(i64::from)
    }

    fn is_finished(&self) -> bool {
        finishing_condition(self).is_some()
    }

    fn finished_at(&self) -> Option<DateTime<Utc>> {
        finishing_condition(self)?
            .last_transition_time
            .as_ref()
            .map(|t| t.0)
    }
}

impl Expiring for Pod {
    fn ttl_seconds(&self) -> Option<i64> {
        let raw = self.annotation(ANNOTATION_POD_TTL)?;
        match raw.trim().parse() {
            Ok(ttl) => Some(ttl),
            Err(_) => {
                warn!("Ignoring invalid {} annotation '{}' on pod {}", ANNOTATION_POD_TTL, raw, self.object_key());
                None
            }
        }
    }

    fn is_finished(&self) -> bool {
        pod::is_finished(self)
    }

    fn finished_at(&self) -> Option<DateTime<Utc>> {
        pod::last_terminated_at(self)
    }
}

pub struct TtlAfterFinishedController {
    ctx: ControllerContext,
}

impl TtlAfterFinishedController {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    pub fn register(&self, queue: &Arc<WorkQueue<TtlKey>>) {
        let informers = &self.ctx.informers;
        informers.jobs.add_handler(Arc::new(
            EventHandlerFns::<Job>::new()
                .on_add(enqueue::<Job>(queue.clone(), TtlKey::Job))
                .on_update({
                    let enqueue = enqueue::<Job>(queue.clone(), TtlKey::Job);
                    move |_: &Arc<Job>, job: &Arc<Job>| enqueue(job)
                }),
        ));
        informers.pods.add_handler(Arc::new(
            EventHandlerFns::<Pod>::new()
                .on_add(enqueue::<Pod>(queue.clone(), TtlKey::Pod))
                .on_update({
                    let enqueue = enqueue::<Pod>(queue.clone(), TtlKey::Pod);
                    move |_: &Arc<Pod>, p: &Arc<Pod>| enqueue(p)
                }),
        ));
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let queue = Arc::new(WorkQueue::new(CONTROLLER_TTL_AFTER_FINISHED));
        self.register(&queue);
        let informers = vec![synced(&self.ctx.informers.jobs), synced(&self.ctx.informers.pods)];
        let config = self
            .ctx
            .controller_config(self.ctx.config.ttl_after_finished.concurrent_syncs);
        let controller = Arc::new(Controller::new(Arc::new(self), queue, config));
        controller.run(informers, token).await?;
        Ok(())
    }

    async fn process<T: Expiring>(&self, key: &ObjectKey, cached: Option<Arc<T>>) -> Result<Action> {
        let Some(cached) = cached else {
            return Ok(Action::Done);
        };
        let Some(expiry) = cached.expiry()? else {
            return Ok(Action::Done);
        };

        let now = self.ctx.clock.now();
        if expiry.finished_at > now {
            warn!(
                "{} {} finished at {}, which is in the future; clocks may be skewed",
                T::KIND,
                key,
                expiry.finished_at
            );
            self.ctx.recorder.event(
                &cached.object_reference(),
                EventType::Warning,
                REASON_TTL_SKEW_DETECTED,
                &format!(
                    "The finish time {} is in the future; cleanup is deferred",
                    expiry.finished_at.to_rfc3339()
                ),
            );
            return Ok(Action::requeue(until(now, expiry.expires_at())));
        }
        if expiry.expires_at() > now {
            debug!("{} {} expires at {}", T::KIND, key, expiry.expires_at());
            return Ok(Action::requeue(until(now, expiry.expires_at())));
        }

        // The cache may be stale: decide again on the stored object
        let Some(fresh) = self.ctx.client.get_opt::<T>(key).await? else {
            return Ok(Action::Done);
        };
        let Some(fresh_expiry) = fresh.expiry()? else {
            debug!("{} {} no longer needs cleanup", T::KIND, key);
            return Ok(Action::Done);
        };
        let now = self.ctx.clock.now();
        if fresh_expiry.expires_at() > now {
            return Ok(Action::requeue(until(now, fresh_expiry.expires_at())));
        }

        let uid = fresh.uid().unwrap_or_default().to_string();
        let opts = DeleteOptions::default()
            .with_propagation(PropagationPolicy::Foreground)
            .with_uid(uid);
        match self.ctx.client.delete::<T>(key, &opts).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(Action::Done),
            Err(e) => return Err(e.into()),
        }

        info!("Deleted {} {} after its TTL expired", T::KIND, key);
        let object: ObjectReference = fresh.object_reference();
        self.ctx.recorder.event(
            &object,
            EventType::Normal,
            REASON_TTL_DELETED,
            &format!("{} {} deleted after TTL expired", T::KIND, key),
        );
        Ok(Action::Done)
    }
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> std::time::Duration {
    (at - now).to_std().unwrap_or_default()
}

fn enqueue<T: Expiring>(
    queue: Arc<WorkQueue<TtlKey>>,
    wrap: fn(ObjectKey) -> TtlKey,
) -> impl Fn(&Arc<T>) + Send + Sync + 'static {
    move |obj| {
        if obj.needs_cleanup() {
            queue.add(wrap(obj.object_key()));
        }
    }
}

#[async_trait]
impl Reconciler for TtlAfterFinishedController {
    type Key = TtlKey;
    type Error = ControllerError;

    fn name(&self) -> &str {
        CONTROLLER_TTL_AFTER_FINISHED
    }

    async fn reconcile(&self, key: &TtlKey) -> Result<Action> {
        let informers = &self.ctx.informers;
        match key {
            TtlKey::Job(key) => self.process::<Job>(key, informers.jobs.store().get(key)).await,
            TtlKey::Pod(key) => self.process::<Pod>(key, informers.pods.store().get(key)).await,
        }
    }

    async fn on_permanent_failure(&self, key: &TtlKey, error: &ControllerError) {
        warn!("Giving up on {}: {}", key, error);
    }
}
