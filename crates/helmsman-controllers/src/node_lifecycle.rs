//! Node lifecycle controller.
//!
//! A periodic monitor pass classifies every node from its `Ready` condition
//! and heartbeat, keeps the `unreachable`/`not-ready` NoExecute taints in
//! sync, tracks per-zone disruption and admits unhealthy nodes for eviction
//! through a per-zone token bucket. The work queue carries pod keys: a pod
//! reconcile evicts pods from admitted nodes, force-deletes pods whose node
//! is gone, and finishes terminating pods once their grace has elapsed.

use crate::config::{NodeLifecycleControllerConfig, CONTROLLER_NODE_LIFECYCLE};
use crate::context::{synced, ControllerContext};
use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helmsman_core::resources::node::{self, AgentVersion, ReadyStatus};
use helmsman_core::resources::pod;
use helmsman_core::taints::{
    self, EvictionVerdict, EFFECT_NO_EXECUTE, TAINT_NODE_NOT_READY, TAINT_NODE_UNREACHABLE,
};
use helmsman_core::{EventType, Node, ObjectKey, Pod, Resource};
use helmsman_runtime::{
    Action, CancellationToken, Controller, EventHandlerFns, Reconciler, Store, Synced,
    TokenBucket, WorkQueue, INDEX_NODE_NAME,
};
use helmsman_storage::DeleteOptions;
use k8s_openapi::api::core::v1::{NodeCondition, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const REASON_NODE_NOT_READY: &str = "NodeNotReady";
pub const REASON_NODE_UNREACHABLE: &str = "NodeUnreachable";
pub const REASON_REMOVING_NODE: &str = "RemovingNode";
pub const REASON_DELETING_ALL_PODS: &str = "DeletingAllPods";
pub const REASON_TAINT_MANAGER_EVICTION: &str = "TaintManagerEviction";
pub const REASON_EVICTION_FAILED: &str = "EvictionFailed";

/// Reason set on a `Ready` condition the controller marks `Unknown`
pub const REASON_NODE_STATUS_UNKNOWN: &str = "NodeStatusUnknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    NotReady,
    Unreachable,
}

impl NodeHealth {
    /// NoExecute taint that should be present for this health
    fn taint_key(self) -> Option<&'static str> {
        match self {
            NodeHealth::Healthy => None,
            NodeHealth::NotReady => Some(TAINT_NODE_NOT_READY),
            NodeHealth::Unreachable => Some(TAINT_NODE_UNREACHABLE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    Normal,
    PartialDisruption,
    FullDisruption,
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ZoneState::Normal => "Normal",
            ZoneState::PartialDisruption => "PartialDisruption",
            ZoneState::FullDisruption => "FullDisruption",
        };
        f.write_str(s)
    }
}

/// Every node unhealthy is a full disruption; more than two unhealthy nodes
/// making up more than `threshold` of the zone is a partial one
pub fn zone_state(total: usize, unhealthy: usize, threshold: f64) -> ZoneState {
    if total > 0 && unhealthy == total {
        ZoneState::FullDisruption
    } else if unhealthy > 2 && unhealthy as f64 / total as f64 > threshold {
        ZoneState::PartialDisruption
    } else {
        ZoneState::Normal
    }
}

/// Node admissions per second for a zone
pub fn eviction_rate(
    state: ZoneState,
    zone_size: usize,
    all_zones_full: bool,
    config: &NodeLifecycleControllerConfig,
) -> f64 {
    match state {
        ZoneState::Normal => config.node_eviction_rate,
        ZoneState::PartialDisruption if zone_size >= config.large_cluster_size_threshold => {
            config.secondary_node_eviction_rate
        }
        ZoneState::PartialDisruption => 0.0,
        ZoneState::FullDisruption if all_zones_full => 0.0,
        ZoneState::FullDisruption => config.node_eviction_rate,
    }
}

fn is_managed_taint(taint: &Taint) -> bool {
    taint.effect == EFFECT_NO_EXECUTE
        && (taint.key == TAINT_NODE_UNREACHABLE || taint.key == TAINT_NODE_NOT_READY)
}

/// Ready condition flipped to `Unknown`, keeping the last heartbeat
fn mark_unknown(node: &mut Node, now: DateTime<Utc>) {
    let status = node.status.get_or_insert_with(Default::default);
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    let message = "Node agent stopped posting node status.".to_string();
    match conditions.iter_mut().find(|c| c.type_ == "Ready") {
        Some(c) => {
            c.status = ReadyStatus::Unknown.to_string();
            c.reason = Some(REASON_NODE_STATUS_UNKNOWN.to_string());
            c.message = Some(message);
            c.last_transition_time = Some(Time(now));
        }
        None => conditions.push(NodeCondition {
            type_: "Ready".to_string(),
            status: ReadyStatus::Unknown.to_string(),
            reason: Some(REASON_NODE_STATUS_UNKNOWN.to_string()),
            message: Some(message),
            last_transition_time: Some(Time(now)),
            ..Default::default()
        }),
    }
}

fn deletion_deadline(pod: &Pod) -> Option<DateTime<Utc>> {
    let at = pod.metadata.deletion_timestamp.as_ref()?.0;
    let grace = pod.metadata.deletion_grace_period_seconds.unwrap_or(0).max(0);
    Some(at + chrono::Duration::seconds(grace))
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> std::time::Duration {
    (at - now).to_std().unwrap_or_default()
}

struct ZoneEvictor {
    bucket: TokenBucket,
    pending: VecDeque<String>,
    state: ZoneState,
}

#[derive(Default)]
struct MonitorState {
    healthy_streak: HashMap<String, u32>,
    zones: HashMap<String, ZoneEvictor>,
}

pub struct NodeLifecycleController {
    ctx: ControllerContext,
    queue: Arc<WorkQueue<ObjectKey>>,
    monitor: Mutex<MonitorState>,
    /// Unhealthy nodes that passed the zone rate limiter
    admitted: Arc<RwLock<HashSet<String>>>,
    min_agent_version: Option<AgentVersion>,
}

impl NodeLifecycleController {
    pub fn new(ctx: ControllerContext) -> Self {
        let raw = &ctx.config.node_lifecycle.pod_status_reconciliation_min_version;
        let min_agent_version = AgentVersion::parse(raw);
        if min_agent_version.is_none() {
            warn!("Ignoring unparseable podStatusReconciliationMinVersion '{}'", raw);
        }
        Self {
            ctx,
            queue: Arc::new(WorkQueue::new(CONTROLLER_NODE_LIFECYCLE)),
            monitor: Mutex::new(MonitorState::default()),
            admitted: Arc::new(RwLock::new(HashSet::new())),
            min_agent_version,
        }
    }

    fn config(&self) -> &NodeLifecycleControllerConfig {
        &self.ctx.config.node_lifecycle
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    pub fn is_admitted(&self, node_name: &str) -> bool {
        self.admitted.read().contains(node_name)
    }

    pub fn zone_state(&self, zone: &str) -> Option<ZoneState> {
        self.monitor.lock().zones.get(zone).map(|z| z.state)
    }

    /// Route pod and node changes to the pod queue
    pub fn register(&self) {
        let informers = &self.ctx.informers;
        let nodes = informers.nodes.store().clone();
        let pods = informers.pods.store().clone();

        let route = route_pod(self.queue.clone(), nodes, self.admitted.clone());
        let route_update = route_pod(
            self.queue.clone(),
            informers.nodes.store().clone(),
            self.admitted.clone(),
        );
        informers.pods.add_handler(Arc::new(
            EventHandlerFns::<Pod>::new()
                .on_add(route)
                .on_update(move |_: &Arc<Pod>, new: &Arc<Pod>| route_update(new)),
        ));

        let queue = self.queue.clone();
        informers.nodes.add_handler(Arc::new(EventHandlerFns::<Node>::new().on_delete(
            move |node: &Arc<Node>| {
                for p in pods.by_index(INDEX_NODE_NAME, node.name()) {
                    queue.add(p.object_key());
                }
            },
        )));
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let this = Arc::new(self);
        this.register();
        let informers = vec![
            synced(&this.ctx.informers.nodes),
            synced(&this.ctx.informers.pods),
        ];
        let config = this.ctx.controller_config(this.config().concurrent_syncs);

        let monitor_token = token.child_token();
        let monitor = tokio::spawn({
            let this = this.clone();
            let token = monitor_token.clone();
            async move { this.monitor_loop(token).await }
        });

        let controller = Arc::new(Controller::new(this.clone(), this.queue.clone(), config));
        let result = controller.run(informers, token).await;
        monitor_token.cancel();
        if let Err(e) = monitor.await {
            warn!("Node monitor task failed: {}", e);
        }
        result?;
        Ok(())
    }

    async fn monitor_loop(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config().node_monitor_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let informers = &self.ctx.informers;
                    if !informers.nodes.has_synced() || !informers.pods.has_synced() {
                        debug!("Node monitor waiting for caches");
                        continue;
                    }
                    if let Err(e) = self.monitor_once().await {
                        warn!("Node monitor pass failed: {}", e);
                    }
                }
            }
        }
    }

    /// One pass over every cached node
    pub async fn monitor_once(&self) -> Result<()> {
        let now = self.ctx.clock.now();
        let mut observed = Vec::new();

        for cached in self.ctx.informers.nodes.store().list() {
            let name = cached.name().to_string();
            match self.observe_node((*cached).clone(), now).await {
                Ok(Some(entry)) => observed.push(entry),
                Ok(None) => {}
                Err(e) => warn!("Failed to process node {}: {}", name, e),
            }
        }

        for name in self.update_zones(&observed) {
            info!("Admitting node {} for eviction", name);
            for p in self.ctx.informers.pods.store().by_index(INDEX_NODE_NAME, &name) {
                self.queue.add(p.object_key());
            }
        }

        // Pods bound to nodes that are no longer cached
        let nodes = self.ctx.informers.nodes.store();
        for p in self.ctx.informers.pods.store().list() {
            let bound = pod::node_name(&p);
            if !bound.is_empty() && nodes.get(&ObjectKey::cluster_scoped(bound)).is_none() {
                self.queue.add(p.object_key());
            }
        }
        Ok(())
    }

    /// Classify a node, write its condition and taints. `None` when the node
    /// has not reported yet or was removed.
    async fn observe_node(&self, node: Node, now: DateTime<Utc>) -> Result<Option<(Node, NodeHealth)>> {
        let Some((node, health)) = self.probe(node, now).await? else {
            return Ok(None);
        };

        let streak = {
            let mut monitor = self.monitor.lock();
            let streak = monitor
                .healthy_streak
                .entry(node.name().to_string())
                .or_insert(0);
            *streak = match health {
                NodeHealth::Healthy => streak.saturating_add(1),
                _ => 0,
            };
            *streak
        };

        let node = match health {
            NodeHealth::Healthy => {
                let node = if streak >= self.config().healthy_observations_to_untaint {
                    self.reconcile_taints(node, None, now).await?
                } else {
                    node
                };
                self.sync_addresses(node).await?
            }
            NodeHealth::NotReady | NodeHealth::Unreachable => {
                if self.instance_gone(&node).await {
                    self.remove_node(&node).await?;
                    return Ok(None);
                }
                self.reconcile_taints(node, health.taint_key(), now).await?
            }
        };
        Ok(Some((node, health)))
    }

    /// Health from the Ready condition, marking stale nodes `Unknown`
    async fn probe(&self, node: Node, now: DateTime<Utc>) -> Result<Option<(Node, NodeHealth)>> {
        let ready = node::condition(&node, "Ready");
        let has_condition = ready.is_some();
        let last_seen = ready
            .and_then(|c| c.last_heartbeat_time.as_ref())
            .or(node.metadata.creation_timestamp.as_ref())
            .map(|t| t.0);
        let stale = last_seen
            .map(|t| now - t > self.config().node_monitor_grace_period())
            .unwrap_or(true);

        let health = match (node::ready_status(&node), stale) {
            (ReadyStatus::Unknown, _) if has_condition => NodeHealth::Unreachable,
            (_, true) => {
                info!("Node {} stopped reporting status, marking it Unknown", node.name());
                let mut updated = node.clone();
                mark_unknown(&mut updated, now);
                let updated = self.ctx.client.update_status(&updated).await?;
                return Ok(Some((updated, NodeHealth::Unreachable)));
            }
            (ReadyStatus::Unknown, false) => return Ok(None),
            (ReadyStatus::True, false) => NodeHealth::Healthy,
            (ReadyStatus::False, false) => NodeHealth::NotReady,
        };
        Ok(Some((node, health)))
    }

    /// Make the managed NoExecute taints match `wanted`
    async fn reconcile_taints(&self, node: Node, wanted: Option<&'static str>, now: DateTime<Utc>) -> Result<Node> {
        let current = taints::node_taints(&node);
        let mut next: Vec<Taint> = current
            .iter()
            .filter(|t| !is_managed_taint(t) || Some(t.key.as_str()) == wanted)
            .cloned()
            .collect();

        let mut added = false;
        if let Some(key) = wanted {
            if !taints::has_taint(&next, key, EFFECT_NO_EXECUTE) {
                next.push(Taint {
                    key: key.to_string(),
                    effect: EFFECT_NO_EXECUTE.to_string(),
                    time_added: Some(Time(now)),
                    value: None,
                });
                added = true;
            }
        }
        if next == current {
            return Ok(node);
        }

        let mut updated = node.clone();
        updated.spec.get_or_insert_with(Default::default).taints = Some(next);
        let updated = self.ctx.client.update(&updated).await?;

        match wanted {
            Some(key) if added => {
                let (reason, condition) = if key == TAINT_NODE_UNREACHABLE {
                    (REASON_NODE_UNREACHABLE, "NodeUnreachable")
                } else {
                    (REASON_NODE_NOT_READY, "NodeNotReady")
                };
                info!("Tainted node {} with {}:NoExecute", node.name(), key);
                self.ctx.recorder.event(
                    &node.object_reference(),
                    EventType::Normal,
                    reason,
                    &format!("Node {} status is now: {}", node.name(), condition),
                );
            }
            _ => info!("Updated NoExecute taints on node {}", node.name()),
        }
        Ok(updated)
    }

    /// `true` only when the provider positively reports the instance gone
    async fn instance_gone(&self, node: &Node) -> bool {
        let (Some(cloud), Some(provider_id)) = (self.ctx.cloud.as_ref(), node::provider_id(node)) else {
            return false;
        };
        match cloud.instance_exists_by_provider_id(provider_id).await {
            Ok(exists) => !exists,
            Err(e) => {
                warn!("Could not check instance {} for node {}: {}", provider_id, node.name(), e);
                false
            }
        }
    }

    async fn remove_node(&self, node: &Node) -> Result<()> {
        let name = node.name().to_string();
        let node_ref = node.object_reference();
        info!("Instance behind node {} is gone, removing it", name);

        self.ctx.recorder.event(
            &node_ref,
            EventType::Normal,
            REASON_DELETING_ALL_PODS,
            &format!("Deleting all Pods from Node {}.", name),
        );
        for p in self.ctx.informers.pods.store().by_index(INDEX_NODE_NAME, &name) {
            self.force_delete(&p).await?;
        }

        self.ctx.recorder.event(
            &node_ref,
            EventType::Normal,
            REASON_REMOVING_NODE,
            &format!("Removing Node {} from Controller", name),
        );
        let opts = DeleteOptions::default().with_uid(node.uid().unwrap_or_default());
        match self.ctx.client.delete::<Node>(&node.object_key(), &opts).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let mut monitor = self.monitor.lock();
        monitor.healthy_streak.remove(&name);
        for zone in monitor.zones.values_mut() {
            zone.pending.retain(|n| *n != name);
        }
        drop(monitor);
        self.admitted.write().remove(&name);
        Ok(())
    }

    /// Refresh `status.addresses` from the provider. Provider errors leave
    /// the addresses as they are; the next monitor pass asks again.
    async fn sync_addresses(&self, node: Node) -> Result<Node> {
        let Some(cloud) = self.ctx.cloud.as_ref() else {
            return Ok(node);
        };
        let addresses = match cloud.node_addresses(node.name()).await {
            Ok(addresses) => addresses,
            Err(e) if e.is_instance_not_found() => {
                debug!("Provider has no addresses for node {}", node.name());
                return Ok(node);
            }
            Err(e) => {
                warn!(
                    "Failed to get addresses for node {}: {}; retrying next pass",
                    node.name(),
                    e
                );
                return Ok(node);
            }
        };
        if node.status.as_ref().and_then(|s| s.addresses.as_ref()) == Some(&addresses) {
            return Ok(node);
        }
        let mut updated = node.clone();
        updated.status.get_or_insert_with(Default::default).addresses = Some(addresses);
        debug!("Updating addresses of node {}", node.name());
        Ok(self.ctx.client.update_status(&updated).await?)
    }

    /// Recompute zone states and admit queued nodes the buckets allow.
    /// Returns the newly admitted node names.
    fn update_zones(&self, observed: &[(Node, NodeHealth)]) -> Vec<String> {
        let config = self.config();
        let mut sizes: HashMap<String, (usize, usize)> = HashMap::new();
        for (n, health) in observed {
            let entry = sizes.entry(node::zone(n)).or_default();
            entry.0 += 1;
            if *health != NodeHealth::Healthy {
                entry.1 += 1;
            }
        }
        let states: HashMap<&String, ZoneState> = sizes
            .iter()
            .map(|(zone, (total, unhealthy))| {
                (zone, zone_state(*total, *unhealthy, config.unhealthy_zone_threshold))
            })
            .collect();
        let all_full = !states.is_empty() && states.values().all(|s| *s == ZoneState::FullDisruption);

        let mut admitted = self.admitted.write();
        let mut monitor = self.monitor.lock();

        let present: HashSet<&str> = observed.iter().map(|(n, _)| n.name()).collect();
        admitted.retain(|n| present.contains(n.as_str()));
        monitor.healthy_streak.retain(|n, _| present.contains(n.as_str()));

        for (n, health) in observed {
            let name = n.name().to_string();
            if *health == NodeHealth::Healthy {
                admitted.remove(&name);
                for zone in monitor.zones.values_mut() {
                    zone.pending.retain(|p| *p != name);
                }
                continue;
            }
            if admitted.contains(&name) {
                continue;
            }
            let zone = monitor
                .zones
                .entry(node::zone(n))
                .or_insert_with(|| ZoneEvictor {
                    bucket: TokenBucket::new(config.node_eviction_rate, 1),
                    pending: VecDeque::new(),
                    state: ZoneState::Normal,
                });
            if !zone.pending.contains(&name) {
                zone.pending.push_back(name);
            }
        }

        let mut newly = Vec::new();
        for (zone, evictor) in monitor.zones.iter_mut() {
            let state = states.get(zone).copied().unwrap_or(ZoneState::Normal);
            let size = sizes.get(zone).map(|s| s.0).unwrap_or(0);
            if state != evictor.state {
                info!("Zone '{}' is now in state {}", zone, state);
                evictor.state = state;
            }
            let rate = eviction_rate(state, size, all_full, config);
            evictor.bucket.set_rate(rate);
            if rate <= 0.0 {
                continue;
            }
            while !evictor.pending.is_empty() && evictor.bucket.try_accept() {
                if let Some(name) = evictor.pending.pop_front() {
                    newly.push(name);
                }
            }
        }
        admitted.extend(newly.iter().cloned());
        newly
    }

    async fn node_for(&self, name: &str) -> Result<Option<Node>> {
        let key = ObjectKey::cluster_scoped(name);
        if let Some(cached) = self.ctx.informers.nodes.store().get(&key) {
            return Ok(Some((*cached).clone()));
        }
        Ok(self.ctx.client.get_opt::<Node>(&key).await?)
    }

    async fn force_delete(&self, p: &Pod) -> Result<()> {
        let opts = DeleteOptions::force().with_uid(p.uid().unwrap_or_default());
        match self.ctx.client.delete::<Pod>(&p.object_key(), &opts).await {
            Ok(_) => {
                info!("Force deleted pod {}", p.object_key());
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup_terminating(&self, p: &Pod) -> Result<Action> {
        let bound = pod::node_name(p);
        if bound.is_empty() {
            self.force_delete(p).await?;
            return Ok(Action::Done);
        }
        let Some(n) = self.node_for(bound).await? else {
            debug!("Node {} of terminating pod {} is gone", bound, p.object_key());
            self.force_delete(p).await?;
            return Ok(Action::Done);
        };

        let outdated = match (self.min_agent_version, node::kubelet_version(&n).and_then(AgentVersion::parse)) {
            (Some(min), Some(version)) => version < min,
            _ => false,
        };
        if outdated {
            debug!("Node {} runs an agent without graceful deletion", bound);
            self.force_delete(p).await?;
            return Ok(Action::Done);
        }

        let now = self.ctx.clock.now();
        match deletion_deadline(p) {
            Some(deadline) if now < deadline => Ok(Action::requeue(until(now, deadline))),
            _ => {
                self.force_delete(p).await?;
                Ok(Action::Done)
            }
        }
    }

    async fn evict(&self, p: &Pod, n: &Node) -> Result<Action> {
        let grace = pod::termination_grace_period(p).min(self.config().max_pod_grace_period_secs).max(0);
        let opts = DeleteOptions::with_grace(grace).with_uid(p.uid().unwrap_or_default());
        match self.ctx.client.delete::<Pod>(&p.object_key(), &opts).await {
            Ok(_) => {
                info!("Evicting pod {} from node {}", p.object_key(), n.name());
                self.ctx.recorder.event(
                    &p.object_reference(),
                    EventType::Normal,
                    REASON_TAINT_MANAGER_EVICTION,
                    &format!("Marking for deletion Pod {}", p.object_key()),
                );
                Ok(Action::Done)
            }
            Err(e) if e.is_not_found() => Ok(Action::Done),
            Err(e) => {
                self.ctx.recorder.event(
                    &n.object_reference(),
                    EventType::Warning,
                    REASON_EVICTION_FAILED,
                    &format!("Failed to evict pod {}: {}", p.object_key(), e),
                );
                Err(e.into())
            }
        }
    }
}

/// Pods worth a look: terminating, bound to an uncached node, or on an
/// admitted node
fn route_pod(
    queue: Arc<WorkQueue<ObjectKey>>,
    nodes: Arc<Store<Node>>,
    admitted: Arc<RwLock<HashSet<String>>>,
) -> impl Fn(&Arc<Pod>) + Send + Sync + 'static {
    move |p| {
        let bound = pod::node_name(p);
        let interesting = p.is_terminating()
            || (!bound.is_empty()
                && (nodes.get(&ObjectKey::cluster_scoped(bound)).is_none()
                    || admitted.read().contains(bound)));
        if interesting {
            queue.add(p.object_key());
        }
    }
}

#[async_trait]
impl Reconciler for NodeLifecycleController {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn name(&self) -> &str {
        CONTROLLER_NODE_LIFECYCLE
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(p) = self.ctx.informers.pods.store().get(key) else {
            return Ok(Action::Done);
        };
        if p.is_terminating() {
            return self.cleanup_terminating(&p).await;
        }

        let bound = pod::node_name(&p);
        if bound.is_empty() {
            return Ok(Action::Done);
        }
        let Some(n) = self.node_for(bound).await? else {
            info!("Node {} of pod {} no longer exists", bound, key);
            self.force_delete(&p).await?;
            return Ok(Action::Done);
        };
        if !self.is_admitted(bound) || pod::is_owned_by_daemon_set(&p) {
            return Ok(Action::Done);
        }

        let now = self.ctx.clock.now();
        let tolerations = p
            .spec
            .as_ref()
            .and_then(|s| s.tolerations.clone())
            .unwrap_or_default();
        match taints::eviction_verdict(&tolerations, &taints::node_taints(&n), now) {
            EvictionVerdict::Keep => Ok(Action::Done),
            EvictionVerdict::EvictAt(at) if at > now => Ok(Action::requeue(until(now, at))),
            EvictionVerdict::EvictAt(_) | EvictionVerdict::Evict => self.evict(&p, &n).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_core::Clock;
    use crate::testutil::{make_node, make_pod, node_status, running_status, Harness};
    use k8s_openapi::api::core::v1::{NodeAddress, NodeSystemInfo, Toleration};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    #[test]
    fn test_zone_state() {
        assert_eq!(zone_state(3, 0, 0.55), ZoneState::Normal);
        assert_eq!(zone_state(3, 3, 0.55), ZoneState::FullDisruption);
        // Two unhealthy nodes never count as partial disruption
        assert_eq!(zone_state(3, 2, 0.55), ZoneState::Normal);
        assert_eq!(zone_state(5, 3, 0.55), ZoneState::PartialDisruption);
        assert_eq!(zone_state(10, 3, 0.55), ZoneState::Normal);
    }

    #[test]
    fn test_eviction_rate_gating() {
        let config = NodeLifecycleControllerConfig::default();
        assert_eq!(eviction_rate(ZoneState::Normal, 5, false, &config), 0.1);
        // Large, partially disrupted zones slow down; small ones pause
        assert_eq!(eviction_rate(ZoneState::PartialDisruption, 50, false, &config), 0.01);
        assert_eq!(eviction_rate(ZoneState::PartialDisruption, 5, false, &config), 0.0);
        assert_eq!(eviction_rate(ZoneState::FullDisruption, 5, false, &config), 0.1);
        assert_eq!(eviction_rate(ZoneState::FullDisruption, 5, true, &config), 0.0);

        for size in [20usize, 100, 1000] {
            assert!(
                eviction_rate(ZoneState::PartialDisruption, size, false, &config)
                    <= config.secondary_node_eviction_rate
            );
        }
    }

    async fn add_node(h: &Harness, name: &str, zone: &str, ready: &str) {
        let n = h.create(make_node(name, zone)).await;
        let mut n = n;
        n.status = Some(node_status(ready, h.clock.now()));
        h.set_status(&n).await;
    }

    async fn add_pod(h: &Harness, name: &str, node_name: &str) -> Pod {
        let mut p = make_pod("default", name);
        p.spec.as_mut().unwrap().node_name = Some(node_name.to_string());
        p.spec.as_mut().unwrap().termination_grace_period_seconds = Some(30);
        let mut p = h.create(p).await;
        p.status = Some(running_status(true, "10.0.0.9"));
        h.set_status(&p).await
    }

    async fn reconcile_all(h: &Harness, controller: &NodeLifecycleController) -> Vec<Action> {
        h.sync().await;
        let mut actions = Vec::new();
        for key in h.ctx.informers.pods.store().keys() {
            actions.push(controller.reconcile(&key).await.unwrap());
        }
        actions
    }

    #[tokio::test]
    async fn test_unreachable_node_pods_are_evicted() {
        let h = Harness::new();
        let controller = NodeLifecycleController::new(h.ctx.clone());
        add_node(&h, "n0", "z2", "True").await;
        add_node(&h, "n1", "z1", "True").await;
        for i in 0..4 {
            add_pod(&h, &format!("app-{}", i), "n1").await;
        }

        let mut ds = make_pod("default", "agent");
        ds.spec.as_mut().unwrap().node_name = Some("n1".to_string());
        ds.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "DaemonSet".to_string(),
            name: "agent".to_string(),
            uid: "ds-uid".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        h.create(ds).await;

        let mut tolerant = make_pod("default", "tolerant");
        let spec = tolerant.spec.as_mut().unwrap();
        spec.node_name = Some("n1".to_string());
        spec.tolerations = Some(vec![Toleration {
            key: Some(TAINT_NODE_UNREACHABLE.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some(EFFECT_NO_EXECUTE.to_string()),
            ..Default::default()
        }]);
        h.create(tolerant).await;

        h.sync().await;
        controller.monitor_once().await.unwrap();
        assert!(!controller.is_admitted("n1"));

        // n0 keeps heartbeating, n1 goes silent past the grace period
        h.advance(41);
        let mut n0 = h.get_node("n0").await.unwrap();
        n0.status = Some(node_status("True", h.clock.now()));
        h.set_status(&n0).await;
        h.sync().await;
        controller.monitor_once().await.unwrap();

        let n1 = h.get_node("n1").await.unwrap();
        assert_eq!(node::ready_status(&n1), ReadyStatus::Unknown);
        assert!(taints::has_taint(&taints::node_taints(&n1), TAINT_NODE_UNREACHABLE, EFFECT_NO_EXECUTE));
        assert!(h.recorder.has(REASON_NODE_UNREACHABLE));
        assert!(controller.is_admitted("n1"));
        assert_eq!(controller.zone_state("z1"), Some(ZoneState::FullDisruption));

        reconcile_all(&h, &controller).await;
        for i in 0..4 {
            let p: Pod = h.get("default", &format!("app-{}", i)).await.unwrap();
            assert!(p.is_terminating());
        }
        assert!(!h.get::<Pod>("default", "agent").await.unwrap().is_terminating());
        assert!(!h.get::<Pod>("default", "tolerant").await.unwrap().is_terminating());
        let evictions = h
            .recorder
            .reasons()
            .iter()
            .filter(|r| *r == REASON_TAINT_MANAGER_EVICTION)
            .count();
        assert_eq!(evictions, 4);

        // Grace not yet elapsed: terminating pods are requeued, not removed
        h.advance(30);
        let actions = reconcile_all(&h, &controller).await;
        assert!(actions.iter().any(|a| matches!(a, Action::RequeueAfter(_))));
        assert!(h.get::<Pod>("default", "app-0").await.is_some());

        h.advance(31);
        reconcile_all(&h, &controller).await;
        for i in 0..4 {
            assert!(h.get::<Pod>("default", &format!("app-{}", i)).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_not_ready_taint_and_recovery() {
        let h = Harness::new();
        let controller = NodeLifecycleController::new(h.ctx.clone());
        add_node(&h, "n0", "z2", "True").await;
        add_node(&h, "n1", "z1", "False").await;

        h.sync().await;
        controller.monitor_once().await.unwrap();
        let n1 = h.get_node("n1").await.unwrap();
        assert!(taints::has_taint(&taints::node_taints(&n1), TAINT_NODE_NOT_READY, EFFECT_NO_EXECUTE));
        assert!(h.recorder.has(REASON_NODE_NOT_READY));

        let mut n1 = n1;
        n1.status = Some(node_status("True", h.clock.now()));
        h.set_status(&n1).await;
        h.sync().await;
        controller.monitor_once().await.unwrap();

        let n1 = h.get_node("n1").await.unwrap();
        assert!(taints::node_taints(&n1).is_empty());
        assert!(!controller.is_admitted("n1"));
    }

    #[tokio::test]
    async fn test_eviction_is_rate_limited_per_zone() {
        let h = Harness::new();
        let controller = NodeLifecycleController::new(h.ctx.clone());
        add_node(&h, "healthy", "z2", "True").await;
        for name in ["a", "b", "c"] {
            add_node(&h, name, "z1", "False").await;
        }
        h.sync().await;
        controller.monitor_once().await.unwrap();

        // The bucket starts with one token and refills at 0.1/s
        let admitted = ["a", "b", "c"]
            .iter()
            .filter(|n| controller.is_admitted(n))
            .count();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_vanished_instance_removes_node() {
        let h = Harness::new();
        let controller = NodeLifecycleController::new(h.ctx.clone());
        add_node(&h, "n0", "z2", "True").await;
        add_node(&h, "n2", "z1", "False").await;
        add_pod(&h, "web", "n2").await;
        h.cloud.remove_instance("mock://n2").await;

        h.sync().await;
        controller.monitor_once().await.unwrap();

        assert!(h.get_node("n2").await.is_none());
        assert!(h.get::<Pod>("default", "web").await.is_none());
        assert!(h.recorder.has(REASON_DELETING_ALL_PODS));
        assert!(h.recorder.has(REASON_REMOVING_NODE));
    }

    #[tokio::test]
    async fn test_terminating_pod_on_outdated_agent_is_force_deleted() {
        let h = Harness::new();
        let controller = NodeLifecycleController::new(h.ctx.clone());
        let n = h.create(make_node("old", "")).await;
        let mut n = n;
        let mut status = node_status("True", h.clock.now());
        status.node_info = Some(NodeSystemInfo {
            kubelet_version: "v1.1.3".to_string(),
            ..Default::default()
        });
        n.status = Some(status);
        h.set_status(&n).await;

        let p = add_pod(&h, "legacy", "old").await;
        h.ctx
            .client
            .delete::<Pod>(&p.object_key(), &DeleteOptions::default())
            .await
            .unwrap();
        assert!(h.get::<Pod>("default", "legacy").await.unwrap().is_terminating());

        h.sync().await;
        controller.reconcile(&p.object_key()).await.unwrap();
        assert!(h.get::<Pod>("default", "legacy").await.is_none());
    }

    #[tokio::test]
    async fn test_pod_on_missing_node_is_force_deleted() {
        let h = Harness::new();
        let controller = NodeLifecycleController::new(h.ctx.clone());
        let p = add_pod(&h, "stray", "ghost").await;

        h.sync().await;
        controller.monitor_once().await.unwrap();
        assert!(controller.queue().len() >= 1);

        controller.reconcile(&p.object_key()).await.unwrap();
        assert!(h.get::<Pod>("default", "stray").await.is_none());
    }

    #[tokio::test]
    async fn test_address_sync_retries_next_pass() {
        let h = Harness::new();
        let controller = NodeLifecycleController::new(h.ctx.clone());
        add_node(&h, "n1", "z1", "True").await;
        let addresses = vec![NodeAddress {
            type_: "InternalIP".to_string(),
            address: "10.1.0.7".to_string(),
        }];
        h.cloud.set_addresses("n1", addresses.clone()).await;
        h.cloud.fail_next(1).await;

        h.sync().await;
        controller.monitor_once().await.unwrap();
        let n1 = h.get_node("n1").await.unwrap();
        assert!(n1.status.as_ref().unwrap().addresses.is_none());
        assert!(!controller.is_admitted("n1"));

        h.sync().await;
        controller.monitor_once().await.unwrap();
        let n1 = h.get_node("n1").await.unwrap();
        assert_eq!(n1.status.unwrap().addresses, Some(addresses));
    }
}
