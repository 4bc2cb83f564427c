//! StatefulSet controller.
//!
//! Drives the pods selected by a set to exactly `{name-0 .. name-(N-1)}`.
//! Pods are created in ascending ordinal order, each only once its
//! predecessors are running and ready, and removed in descending order, each
//! only once its successors are gone. A reconcile performs at most one pod
//! mutation; the resulting pod event brings the set back to the queue.

use crate::config::CONTROLLER_STATEFULSET;
use crate::context::{synced, ControllerContext};
use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use helmsman_core::resources::pod;
use helmsman_core::{EventType, LabelSelector, ObjectKey, Pod, Resource, StatefulSet};
use helmsman_runtime::{
    Action, CancellationToken, Controller, EventHandlerFns, Reconciler, Store, WorkQueue,
    INDEX_NAMESPACE,
};
use helmsman_storage::DeleteOptions;
use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use sha2::{Digest, Sha256};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const LABEL_POD_NAME: &str = "statefulset.kubernetes.io/pod-name";
pub const LABEL_REVISION_HASH: &str = "controller-revision-hash";

pub const REASON_SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
pub const REASON_FAILED_CREATE: &str = "FailedCreate";
pub const REASON_SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
pub const REASON_FAILED_DELETE: &str = "FailedDelete";
pub const REASON_INVALID_ORDINAL: &str = "InvalidOrdinal";
pub const REASON_DUPLICATE_ORDINAL: &str = "DuplicateOrdinal";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// How pods with a stale revision are replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Replace stale pods with ordinal >= partition, highest first
    RollingUpdate { partition: u32 },
    /// Stale pods are only replaced when the user deletes them
    OnDelete,
}

/// The single mutation a reconcile performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Create(u32),
    Delete(u32),
    Wait(String),
    Idle,
}

/// Ordinal of `pod_name` within set `set_name`, or `None` if the name does
/// not have the form `<set>-<digits>`
pub fn parse_ordinal(set_name: &str, pod_name: &str) -> Option<u32> {
    let suffix = pod_name.strip_prefix(set_name)?.strip_prefix('-')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

pub fn pod_name(set: &StatefulSet, ordinal: u32) -> String {
    format!("{}-{}", set.name(), ordinal)
}

/// `<set>-<hash>` where hash is the first 10 hex digits of the SHA-256 of
/// the serialized pod template
pub fn revision_name(set: &StatefulSet) -> Result<String> {
    let template = helmsman_core::to_value(&set.spec.as_ref().map(|s| &s.template))?;
    let digest = Sha256::digest(template.to_string().as_bytes());
    let hash = hex::encode(digest);
    Ok(format!("{}-{}", set.name(), &hash[..10]))
}

pub fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.labels()?.get(LABEL_REVISION_HASH).map(String::as_str)
}

pub fn update_policy(spec: &StatefulSetSpec) -> UpdatePolicy {
    let strategy = spec.update_strategy.as_ref();
    match strategy.and_then(|s| s.type_.as_deref()) {
        Some("OnDelete") => UpdatePolicy::OnDelete,
        _ => {
            let partition = strategy
                .and_then(|s| s.rolling_update.as_ref())
                .and_then(|r| r.partition)
                .unwrap_or(0)
                .max(0) as u32;
            UpdatePolicy::RollingUpdate { partition }
        }
    }
}

/// Terminating and in a finished phase; no longer blocks lower ordinals
fn is_terminal(pod: &Pod) -> bool {
    pod.is_terminating() && pod::is_finished(pod)
}

/// Decide the next mutation for a set with `replicas` desired pods.
///
/// Scale-up walks `0..replicas` and stops at the first pod that is missing,
/// terminating or not ready. Missing pods are not created while a condemned
/// pod (ordinal >= replicas) is still live. Scale-down walks condemned pods
/// from the highest ordinal and waits for each to finish terminating.
pub fn plan(
    replicas: u32,
    pods: &BTreeMap<u32, Arc<Pod>>,
    update_revision: &str,
    policy: UpdatePolicy,
) -> Step {
    let condemned_live = pods
        .range(replicas..)
        .any(|(_, p)| !p.is_terminating());

    for ordinal in 0..replicas {
        match pods.get(&ordinal) {
            None if condemned_live => break,
            None => return Step::Create(ordinal),
            Some(p) if p.is_terminating() => {
                return Step::Wait(format!("pod {} is terminating", p.name()))
            }
            Some(p) if !pod::is_running_and_ready(p) => {
                return Step::Wait(format!("pod {} is not running and ready", p.name()))
            }
            Some(_) => {}
        }
    }

    for (ordinal, p) in pods.range(replicas..).rev() {
        if !p.is_terminating() {
            return Step::Delete(*ordinal);
        }
        if is_terminal(p) {
            continue;
        }
        return Step::Wait(format!("condemned pod {} is terminating", p.name()));
    }

    if let UpdatePolicy::RollingUpdate { partition } = policy {
        for ordinal in (partition..replicas).rev() {
            if let Some(p) = pods.get(&ordinal) {
                if pod_revision(p) != Some(update_revision) {
                    return Step::Delete(ordinal);
                }
            }
        }
    }
    Step::Idle
}

/// `a` wins a duplicate ordinal over `b`: earlier creation, then smaller uid
fn precedes(a: &Pod, b: &Pod) -> bool {
    let created = |p: &Pod| p.metadata.creation_timestamp.as_ref().map(|t| t.0);
    match (created(a), created(b)) {
        (Some(x), Some(y)) if x != y => x < y,
        _ => a.uid().unwrap_or_default() < b.uid().unwrap_or_default(),
    }
}

fn owner_reference(set: &StatefulSet) -> OwnerReference {
    OwnerReference {
        api_version: StatefulSet::API_VERSION.to_string(),
        kind: StatefulSet::KIND.to_string(),
        name: set.name().to_string(),
        uid: set.uid().unwrap_or_default().to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Pod `ordinal` built from the set's current template
pub fn new_pod(set: &StatefulSet, ordinal: u32, revision: &str) -> Pod {
    let name = pod_name(set, ordinal);
    let (template_meta, template_spec, service_name) = match set.spec.as_ref() {
        Some(spec) => {
            let service_name: Option<String> = spec.service_name.clone().into();
            (
                spec.template.metadata.clone().unwrap_or_default(),
                spec.template.spec.clone(),
                service_name,
            )
        }
        None => (ObjectMeta::default(), None, None),
    };

    let mut labels = template_meta.labels.unwrap_or_default();
    labels.insert(LABEL_POD_NAME.to_string(), name.clone());
    labels.insert(LABEL_REVISION_HASH.to_string(), revision.to_string());

    let spec = template_spec.map(|mut spec| {
        spec.hostname = Some(name.clone());
        if let Some(service) = service_name.filter(|s| !s.is_empty()) {
            spec.subdomain = Some(service);
        }
        spec
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(set.namespace().to_string()),
            labels: Some(labels),
            annotations: template_meta.annotations,
            owner_references: Some(vec![owner_reference(set)]),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Status derived from the pods currently owned by the set
pub fn compute_status(
    set: &StatefulSet,
    replicas: u32,
    pods: &BTreeMap<u32, Arc<Pod>>,
    update_revision: &str,
) -> StatefulSetStatus {
    let previous = set.status.clone().unwrap_or_default();
    let live: Vec<&Arc<Pod>> = pods.values().filter(|p| !p.is_terminating()).collect();
    let count = |revision: &str| {
        live.iter()
            .filter(|p| pod_revision(p) == Some(revision))
            .count() as i32
    };

    let ready = live.iter().filter(|p| pod::is_running_and_ready(p)).count() as i32;
    let updated = count(update_revision);
    let target = replicas as i32;

    let mut current_revision = previous
        .current_revision
        .clone()
        .unwrap_or_else(|| update_revision.to_string());
    if updated == target && ready == target && live.len() as i32 == target {
        current_revision = update_revision.to_string();
    }

    StatefulSetStatus {
        replicas: live.len() as i32,
        ready_replicas: Some(ready),
        current_replicas: Some(count(&current_revision)),
        updated_replicas: Some(updated),
        current_revision: Some(current_revision),
        update_revision: Some(update_revision.to_string()),
        observed_generation: set.metadata.generation,
        ..previous
    }
}

/// Sets that should look at `pod`: its controlling set, or for orphans
/// every set in the namespace whose selector matches
fn sets_for_pod(sets: &Store<StatefulSet>, pod: &Pod) -> Vec<ObjectKey> {
    if let Some(owner) = pod.controller_ref() {
        if owner.kind != StatefulSet::KIND {
            return Vec::new();
        }
        let key = ObjectKey::new(pod.namespace(), owner.name.as_str());
        return match sets.get(&key) {
            Some(set) if set.uid() == Some(owner.uid.as_str()) => vec![key],
            _ => Vec::new(),
        };
    }
    sets.by_index(INDEX_NAMESPACE, pod.namespace())
        .into_iter()
        .filter(|set| {
            set.spec
                .as_ref()
                .and_then(|s| LabelSelector::from_k8s(&s.selector).ok())
                .map(|sel| !sel.is_empty() && sel.matches(pod.labels()))
                .unwrap_or(false)
        })
        .map(|set| set.object_key())
        .collect()
}

fn enqueue_set(queue: Arc<WorkQueue<ObjectKey>>) -> impl Fn(&Arc<StatefulSet>) + Send + Sync + 'static {
    move |set| queue.add(set.object_key())
}

fn route_pod(
    queue: Arc<WorkQueue<ObjectKey>>,
    sets: Arc<Store<StatefulSet>>,
) -> impl Fn(&Arc<Pod>) + Send + Sync + 'static {
    move |pod| {
        for key in sets_for_pod(&sets, pod) {
            queue.add(key);
        }
    }
}

pub struct StatefulSetController {
    ctx: ControllerContext,
}

impl StatefulSetController {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// Route set and pod changes to `queue`
    pub fn register(&self, queue: &Arc<WorkQueue<ObjectKey>>) {
        let informers = &self.ctx.informers;
        informers.statefulsets.add_handler(Arc::new(
            EventHandlerFns::<StatefulSet>::new()
                .on_add(enqueue_set(queue.clone()))
                .on_update({
                    let enqueue = enqueue_set(queue.clone());
                    move |_: &Arc<StatefulSet>, set: &Arc<StatefulSet>| enqueue(set)
                })
                .on_delete(enqueue_set(queue.clone())),
        ));

        let sets = informers.statefulsets.store().clone();
        informers.pods.add_handler(Arc::new(
            EventHandlerFns::<Pod>::new()
                .on_add(route_pod(queue.clone(), sets.clone()))
                .on_update({
                    let route = route_pod(queue.clone(), sets.clone());
                    move |old: &Arc<Pod>, new: &Arc<Pod>| {
                        route(old);
                        route(new);
                    }
                })
                .on_delete(route_pod(queue.clone(), sets)),
        ));
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let queue = Arc::new(WorkQueue::new(CONTROLLER_STATEFULSET));
        self.register(&queue);
        let informers = vec![
            synced(&self.ctx.informers.statefulsets),
            synced(&self.ctx.informers.pods),
        ];
        let config = self
            .ctx
            .controller_config(self.ctx.config.statefulset.concurrent_syncs);
        let controller = Arc::new(Controller::new(Arc::new(self), queue, config));
        controller.run(informers, token).await?;
        Ok(())
    }

    /// Owned pods that match the selector, after adopting matching orphans
    /// and releasing owned pods that stopped matching
    async fn claim_pods(&self, set: &StatefulSet, selector: &LabelSelector) -> Result<Vec<Arc<Pod>>> {
        let uid = set.uid().unwrap_or_default();
        let mut owned = Vec::new();

        for pod in self
            .ctx
            .informers
            .pods
            .store()
            .by_index(INDEX_NAMESPACE, set.namespace())
        {
            let matches = selector.matches(pod.labels());
            match pod.controller_ref() {
                Some(owner) if owner.uid == uid => {
                    if matches {
                        owned.push(pod);
                    } else if !pod.is_terminating() {
                        self.release(set, &pod).await?;
                    }
                }
                Some(_) => {}
                None if matches && !pod.is_terminating() => {
                    if let Some(adopted) = self.adopt(set, &pod).await? {
                        owned.push(adopted);
                    }
                }
                None => {}
            }
        }
        Ok(owned)
    }

    async fn adopt(&self, set: &StatefulSet, pod: &Pod) -> Result<Option<Arc<Pod>>> {
        let mut adopted = pod.clone();
        adopted
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(owner_reference(set));
        info!("StatefulSet {} adopting pod {}", set.object_key(), pod.name());
        match self.ctx.client.update(&adopted).await {
            Ok(updated) => Ok(Some(Arc::new(updated))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, set: &StatefulSet, pod: &Pod) -> Result<()> {
        let uid = set.uid().unwrap_or_default();
        let mut released = pod.clone();
        if let Some(refs) = released.metadata.owner_references.as_mut() {
            refs.retain(|r| r.uid != uid);
        }
        info!("StatefulSet {} releasing pod {}", set.object_key(), pod.name());
        match self.ctx.client.update(&released).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Index owned pods by ordinal. Returns `false` as the second value when
    /// an invalid or duplicate ordinal was found; scaling halts until fixed.
    async fn index_by_ordinal(
        &self,
        set: &StatefulSet,
        pods: Vec<Arc<Pod>>,
    ) -> Result<(BTreeMap<u32, Arc<Pod>>, bool)> {
        let mut by_ordinal: BTreeMap<u32, Arc<Pod>> = BTreeMap::new();
        let mut consistent = true;
        let set_ref = set.object_reference();

        for p in pods {
            let Some(ordinal) = parse_ordinal(set.name(), p.name()) else {
                warn!("StatefulSet {} owns pod {} without a valid ordinal", set.object_key(), p.name());
                self.ctx.recorder.event(
                    &set_ref,
                    EventType::Warning,
                    REASON_INVALID_ORDINAL,
                    &format!("Pod {} does not have the form {}-<ordinal>", p.name(), set.name()),
                );
                consistent = false;
                continue;
            };

            match by_ordinal.entry(ordinal) {
                Entry::Vacant(slot) => {
                    slot.insert(p);
                }
                Entry::Occupied(mut slot) => {
                    consistent = false;
                    let loser = if precedes(&p, slot.get()) {
                        slot.insert(p)
                    } else {
                        p
                    };
                    let winner = slot.get().name().to_string();
                    warn!(
                        "StatefulSet {} has duplicate ordinal {}: keeping {}, deleting {}",
                        set.object_key(),
                        ordinal,
                        winner,
                        loser.name()
                    );
                    self.ctx.recorder.event(
                        &set_ref,
                        EventType::Warning,
                        REASON_DUPLICATE_ORDINAL,
                        &format!(
                            "Pods {} and {} share ordinal {}; deleting {}",
                            winner,
                            loser.name(),
                            ordinal,
                            loser.name()
                        ),
                    );
                    if !loser.is_terminating() {
                        self.delete_pod(set, &loser).await?;
                    }
                }
            }
        }
        Ok((by_ordinal, consistent))
    }

    async fn create_pod(&self, set: &StatefulSet, ordinal: u32, revision: &str) -> Result<()> {
        let pod = new_pod(set, ordinal, revision);
        let name = pod.name().to_string();
        match self.ctx.client.create(&pod).await {
            Ok(_) => {
                info!("StatefulSet {} created pod {}", set.object_key(), name);
                self.ctx.recorder.event(
                    &set.object_reference(),
                    EventType::Normal,
                    REASON_SUCCESSFUL_CREATE,
                    &format!("create Pod {} in StatefulSet {} successful", name, set.name()),
                );
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("Pod {} already exists", name);
                Ok(())
            }
            Err(e) => {
                self.ctx.recorder.event(
                    &set.object_reference(),
                    EventType::Warning,
                    REASON_FAILED_CREATE,
                    &format!("create Pod {} in StatefulSet {} failed: {}", name, set.name(), e),
                );
                Err(e.into())
            }
        }
    }

    async fn delete_pod(&self, set: &StatefulSet, pod: &Pod) -> Result<()> {
        let opts = DeleteOptions::default().with_uid(pod.uid().unwrap_or_default());
        match self.ctx.client.delete::<Pod>(&pod.object_key(), &opts).await {
            Ok(_) => {
                info!("StatefulSet {} deleted pod {}", set.object_key(), pod.name());
                self.ctx.recorder.event(
                    &set.object_reference(),
                    EventType::Normal,
                    REASON_SUCCESSFUL_DELETE,
                    &format!("delete Pod {} in StatefulSet {} successful", pod.name(), set.name()),
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                self.ctx.recorder.event(
                    &set.object_reference(),
                    EventType::Warning,
                    REASON_FAILED_DELETE,
                    &format!("delete Pod {} in StatefulSet {} failed: {}", pod.name(), set.name(), e),
                );
                Err(e.into())
            }
        }
    }

    async fn write_status(&self, set: &StatefulSet, status: StatefulSetStatus) -> Result<()> {
        if set.status.as_ref() == Some(&status) {
            return Ok(());
        }
        debug!(
            "StatefulSet {} status: replicas={} ready={:?}",
            set.object_key(),
            status.replicas,
            status.ready_replicas
        );
        let mut updated = set.clone();
        updated.status = Some(status);
        self.ctx.client.update_status(&updated).await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for StatefulSetController {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn name(&self) -> &str {
        CONTROLLER_STATEFULSET
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(set) = self.ctx.informers.statefulsets.store().get(key) else {
            debug!("StatefulSet {} has been deleted", key);
            return Ok(Action::Done);
        };
        if set.is_terminating() {
            return Ok(Action::Done);
        }

        let spec = set
            .spec
            .as_ref()
            .ok_or_else(|| ControllerError::invalid_spec(key.to_string(), "spec is missing"))?;
        let selector = LabelSelector::from_k8s(&spec.selector)
            .map_err(|e| ControllerError::invalid_spec(key.to_string(), e.to_string()))?;
        if selector.is_empty() {
            return Err(ControllerError::invalid_spec(
                key.to_string(),
                "an empty selector would select every pod in the namespace",
            ));
        }
        let replicas = spec.replicas.unwrap_or(1).max(0) as u32;
        let update_revision = revision_name(&set)?;

        let pods = self.claim_pods(&set, &selector).await?;
        let (pods, consistent) = self.index_by_ordinal(&set, pods).await?;

        if consistent {
            match plan(replicas, &pods, &update_revision, update_policy(spec)) {
                Step::Create(ordinal) => self.create_pod(&set, ordinal, &update_revision).await?,
                Step::Delete(ordinal) => {
                    if let Some(p) = pods.get(&ordinal) {
                        self.delete_pod(&set, p).await?;
                    }
                }
                Step::Wait(reason) => debug!("StatefulSet {} waiting: {}", key, reason),
                Step::Idle => {}
            }
        }

        let status = compute_status(&set, replicas, &pods, &update_revision);
        self.write_status(&set, status).await?;
        Ok(Action::Done)
    }

    async fn on_permanent_failure(&self, key: &ObjectKey, error: &ControllerError) {
        if let Some(set) = self.ctx.informers.statefulsets.store().get(key) {
            self.ctx.recorder.event(
                &set.object_reference(),
                EventType::Warning,
                REASON_INVALID_SPEC,
                &error.to_string(),
            );
        }
    }
}
