//! Service load balancer controller.
//!
//! Keeps one external balancer per `LoadBalancer` Service in step with the
//! set of eligible nodes and mirrors the provider's ingress into
//! `status.loadBalancer`. What was last applied for each service is kept in
//! memory so that unchanged services cost neither a provider call nor a
//! status write.
//!
//! A service gets the cleanup finalizer before its balancer is created, so
//! deleting it while the controller is down still tears the balancer down
//! once the controller is back.

use crate::cloud::CloudClient;
use crate::config::{ServiceControllerConfig, CONTROLLER_SERVICE};
use crate::context::{synced, ControllerContext};
use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use helmsman_core::annotations;
use helmsman_core::resources::node::{self, ReadyStatus};
use helmsman_core::{EventType, Node, ObjectKey, Resource, Service};
use helmsman_runtime::{
    Action, CancellationToken, Controller, EventHandlerFns, Reconciler, Store, WorkQueue,
};
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const TYPE_LOAD_BALANCER: &str = "LoadBalancer";

pub const REASON_ENSURING: &str = "EnsuringLoadBalancer";
pub const REASON_ENSURED: &str = "EnsuredLoadBalancer";
pub const REASON_UPDATED: &str = "UpdatedLoadBalancer";
pub const REASON_UPDATE_FAILED: &str = "UpdateLoadBalancerFailed";
pub const REASON_DELETING: &str = "DeletingLoadBalancer";
pub const REASON_DELETED: &str = "DeletedLoadBalancer";
pub const REASON_SYNC_FAILED: &str = "SyncLoadBalancerFailed";
pub const REASON_INVALID_SOURCE_RANGES: &str = "InvalidSourceRanges";

/// Held on a service until its balancer is gone
pub const FINALIZER_LOAD_BALANCER_CLEANUP: &str = "service.kubernetes.io/load-balancer-cleanup";

pub fn is_load_balancer(service: &Service) -> bool {
    service.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some(TYPE_LOAD_BALANCER)
}

pub fn has_cleanup_finalizer(service: &Service) -> bool {
    service
        .metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == FINALIZER_LOAD_BALANCER_CLEANUP)
}

/// Services this controller has something to do for
fn wants_sync(service: &Service) -> bool {
    is_load_balancer(service) || has_cleanup_finalizer(service)
}

/// Nodes a balancer may target
pub fn is_eligible(node: &Node) -> bool {
    node::ready_status(node) == ReadyStatus::True && !node::is_unschedulable(node)
}

/// `(protocol, port, nodePort)` by port name
type PortSignature = BTreeMap<String, (String, i32, Option<i32>)>;

/// Ports keyed by name so that reordering is not a change. `nodePort` is
/// assigned by the server; leave it out when comparing what a user asked for.
pub fn port_signature(service: &Service, include_node_port: bool) -> PortSignature {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| {
                    (
                        p.name.clone().unwrap_or_default(),
                        (
                            p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                            p.port,
                            if include_node_port { p.node_port } else { None },
                        ),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Whether anything the balancer depends on differs between two versions.
/// `nodePort` only counts while the service is a load balancer; for
/// in-cluster types the server may reassign it freely.
pub fn needs_update(old: &Service, new: &Service) -> bool {
    if is_load_balancer(old) != is_load_balancer(new) {
        return true;
    }
    let (os, ns) = match (&old.spec, &new.spec) {
        (Some(os), Some(ns)) => (os, ns),
        (None, None) => return old.uid() != new.uid(),
        _ => return true,
    };
    let external_ips = |s: &k8s_openapi::api::core::v1::ServiceSpec| -> BTreeSet<String> {
        s.external_ips.iter().flatten().cloned().collect()
    };

    let include_node_port = is_load_balancer(new);

    os.type_ != ns.type_
        || port_signature(old, include_node_port) != port_signature(new, include_node_port)
        || os.session_affinity != ns.session_affinity
        || os.load_balancer_ip != ns.load_balancer_ip
        || os.load_balancer_source_ranges != ns.load_balancer_source_ranges
        || external_ips(os) != external_ips(ns)
        || old.uid() != new.uid()
        || old.metadata.annotations != new.metadata.annotations
}

/// Backoff after a failed sync: doubles from `min`, capped at `max`
pub fn next_retry_delay(previous: Duration, min: Duration, max: Duration) -> Duration {
    if previous.is_zero() {
        min
    } else {
        (previous * 2).clamp(min, max)
    }
}

fn sorted_ingress(status: Option<&LoadBalancerStatus>) -> Vec<LoadBalancerIngress> {
    let mut ingress = status
        .and_then(|s| s.ingress.clone())
        .unwrap_or_default();
    ingress.sort_by(|a, b| (&a.ip, &a.hostname).cmp(&(&b.ip, &b.hostname)));
    ingress
}

fn current_ingress(service: &Service) -> Vec<LoadBalancerIngress> {
    sorted_ingress(service.status.as_ref().and_then(|s| s.load_balancer.as_ref()))
}

fn eligible_names(nodes: &Store<Node>) -> BTreeSet<String> {
    nodes
        .list()
        .iter()
        .filter(|n| is_eligible(n))
        .map(|n| n.name().to_string())
        .collect()
}

fn enqueue_load_balancers(services: &Store<Service>, queue: &WorkQueue<ObjectKey>) {
    for svc in services.list() {
        if is_load_balancer(&svc) {
            queue.add(svc.object_key());
        }
    }
}

/// What was last pushed to the provider for one service
#[derive(Debug, Default)]
struct CachedService {
    last_applied: Option<Arc<Service>>,
    applied_nodes: BTreeSet<String>,
    retry_delay: Duration,
}

pub struct ServiceController {
    ctx: ControllerContext,
    cache: Mutex<HashMap<ObjectKey, Arc<Mutex<CachedService>>>>,
    eligible: Arc<Mutex<BTreeSet<String>>>,
}

impl ServiceController {
    pub fn new(ctx: ControllerContext) -> Self {
        Self {
            ctx,
            cache: Mutex::new(HashMap::new()),
            eligible: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    fn config(&self) -> &ServiceControllerConfig {
        &self.ctx.config.service
    }

    pub fn register(&self, queue: &Arc<WorkQueue<ObjectKey>>) {
        let informers = &self.ctx.informers;
        informers.services.add_handler(Arc::new(
            EventHandlerFns::<Service>::new()
                .on_add({
                    let queue = queue.clone();
                    move |svc: &Arc<Service>| {
                        if wants_sync(svc) {
                            queue.add(svc.object_key());
                        }
                    }
                })
                .on_update({
                    let queue = queue.clone();
                    move |old: &Arc<Service>, new: &Arc<Service>| {
                        let deleting = new.is_terminating() && !old.is_terminating();
                        if needs_update(old, new) || (deleting && wants_sync(new)) {
                            queue.add(new.object_key());
                        }
                    }
                })
                .on_delete({
                    let queue = queue.clone();
                    move |svc: &Arc<Service>| queue.add(svc.object_key())
                }),
        ));

        let nodes = informers.nodes.store().clone();
        let services = informers.services.store().clone();
        let eligible = self.eligible.clone();
        let queue = queue.clone();
        let on_node = move || {
            let current = eligible_names(&nodes);
            let mut last = eligible.lock();
            if *last != current {
                debug!("Eligible node set changed to {:?}", current);
                *last = current;
                drop(last);
                enqueue_load_balancers(&services, &queue);
            }
        };
        let on_node = Arc::new(on_node);
        informers.nodes.add_handler(Arc::new(
            EventHandlerFns::<Node>::new()
                .on_add({
                    let f = on_node.clone();
                    move |_: &Arc<Node>| f()
                })
                .on_update({
                    let f = on_node.clone();
                    move |_: &Arc<Node>, _: &Arc<Node>| f()
                })
                .on_delete(move |_: &Arc<Node>| on_node()),
        ));
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        if self.ctx.cloud.is_none() {
            return Err(ControllerError::invalid_config(
                "The service controller needs a cloud provider",
                "Configure a provider or disable the controller with '-service'",
            ));
        }
        let queue = Arc::new(WorkQueue::new(CONTROLLER_SERVICE));
        self.register(&queue);
        let informers = vec![
            synced(&self.ctx.informers.services),
            synced(&self.ctx.informers.nodes),
        ];
        let config = self.ctx.controller_config(self.config().concurrent_syncs);
        let period = self.config().node_sync_period();
        let services = self.ctx.informers.services.store().clone();

        let sync_token = token.child_token();
        let node_sync = tokio::spawn({
            let queue = queue.clone();
            let token = sync_token.clone();
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => enqueue_load_balancers(&services, &queue),
                    }
                }
            }
        });

        let controller = Arc::new(Controller::new(Arc::new(self), queue, config));
        let result = controller.run(informers, token).await;
        sync_token.cancel();
        if let Err(e) = node_sync.await {
            warn!("Node sync task failed: {}", e);
        }
        result?;
        Ok(())
    }

    fn eligible_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .ctx
            .informers
            .nodes
            .store()
            .list()
            .iter()
            .filter(|n| is_eligible(n))
            .map(|n| (**n).clone())
            .collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    fn cached(&self, key: &ObjectKey) -> Option<Arc<Mutex<CachedService>>> {
        self.cache.lock().get(key).cloned()
    }

    fn cache_entry(&self, key: &ObjectKey) -> Arc<Mutex<CachedService>> {
        self.cache.lock().entry(key.clone()).or_default().clone()
    }

    /// Record a failure and return how long to wait before the next attempt
    fn backoff(&self, key: &ObjectKey) -> Duration {
        let config = self.config();
        let entry = self.cache_entry(key);
        let mut entry = entry.lock();
        entry.retry_delay = next_retry_delay(
            entry.retry_delay,
            config.min_retry_delay(),
            config.max_retry_delay(),
        );
        entry.retry_delay
    }

    fn event(&self, service: &Service, event_type: EventType, reason: &str, message: &str) {
        self.ctx
            .recorder
            .event(&service.object_reference(), event_type, reason, message);
    }

    async fn write_ingress(&self, key: &ObjectKey, ingress: Vec<LoadBalancerIngress>) -> Result<()> {
        let Some(mut fresh) = self.ctx.client.get_opt::<Service>(key).await? else {
            return Ok(());
        };
        if current_ingress(&fresh) == ingress {
            return Ok(());
        }
        let status = fresh.status.get_or_insert_with(ServiceStatus::default);
        status.load_balancer = Some(LoadBalancerStatus {
            ingress: (!ingress.is_empty()).then_some(ingress),
        });
        self.ctx.client.update_status(&fresh).await?;
        debug!("Updated load balancer status of {}", key);
        Ok(())
    }

    /// Returns the service with the finalizer, or `None` if it is gone
    async fn add_finalizer(&self, key: &ObjectKey) -> Result<Option<Service>> {
        let Some(mut fresh) = self.ctx.client.get_opt::<Service>(key).await? else {
            return Ok(None);
        };
        if has_cleanup_finalizer(&fresh) {
            return Ok(Some(fresh));
        }
        fresh
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER_LOAD_BALANCER_CLEANUP.to_string());
        match self.ctx.client.update(&fresh).await {
            Ok(updated) => {
                debug!("Added load balancer cleanup finalizer to {}", key);
                Ok(Some(updated))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_finalizer(&self, key: &ObjectKey) -> Result<()> {
        let Some(mut fresh) = self.ctx.client.get_opt::<Service>(key).await? else {
            return Ok(());
        };
        if !has_cleanup_finalizer(&fresh) {
            return Ok(());
        }
        if let Some(finalizers) = fresh.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != FINALIZER_LOAD_BALANCER_CLEANUP);
        }
        match self.ctx.client.update(&fresh).await {
            Ok(_) => {
                debug!("Removed load balancer cleanup finalizer from {}", key);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_balancer(
        &self,
        cloud: &CloudClient,
        key: &ObjectKey,
        target: &Service,
        current: Option<&Service>,
    ) -> Result<Action> {
        self.event(target, EventType::Normal, REASON_DELETING, "Deleting load balancer");
        if let Err(e) = cloud
            .ensure_load_balancer_deleted(&self.ctx.config.cluster_name, target)
            .await
        {
            let delay = self.backoff(key);
            warn!("Failed to delete load balancer of {}: {}; retrying in {:?}", key, e, delay);
            self.event(
                target,
                EventType::Warning,
                REASON_SYNC_FAILED,
                &format!("Error deleting load balancer (will retry): {}", e),
            );
            return Ok(Action::requeue(delay));
        }
        info!("Deleted load balancer of {}", key);
        self.event(target, EventType::Normal, REASON_DELETED, "Deleted load balancer");

        if let Some(current) = current {
            if !current.is_terminating() {
                self.write_ingress(key, Vec::new()).await?;
            }
            self.remove_finalizer(key).await?;
        }
        self.cache.lock().remove(key);
        Ok(Action::Done)
    }

    async fn sync_balancer(&self, cloud: &CloudClient, key: &ObjectKey, svc: Arc<Service>) -> Result<Action> {
        if let Err(e) = annotations::load_balancer_source_ranges(&svc) {
            self.event(
                &svc,
                EventType::Warning,
                REASON_INVALID_SOURCE_RANGES,
                &e.to_string(),
            );
            return Err(ControllerError::invalid_spec(key.to_string(), e.to_string()));
        }

        let nodes = self.eligible_nodes();
        let names: BTreeSet<String> = nodes.iter().map(|n| n.name().to_string()).collect();
        let (unchanged, same_nodes) = match self.cached(key) {
            Some(cached) => {
                let cached = cached.lock();
                let compared = match &cached.last_applied {
                    Some(last) => (!needs_update(last, &svc), cached.applied_nodes == names),
                    None => (false, false),
                };
                compared
            }
            None => (false, false),
        };
        let cluster = &self.ctx.config.cluster_name;

        if unchanged && same_nodes {
            debug!("Load balancer of {} is up to date", key);
            return Ok(Action::Done);
        }

        if unchanged {
            if let Err(e) = cloud.update_load_balancer(cluster, &svc, &nodes).await {
                let delay = self.backoff(key);
                warn!("Failed to update hosts of {}: {}; retrying in {:?}", key, e, delay);
                self.event(
                    &svc,
                    EventType::Warning,
                    REASON_UPDATE_FAILED,
                    &format!("Error updating load balancer with new hosts {:?}: {}", names, e),
                );
                return Ok(Action::requeue(delay));
            }
            info!("Updated load balancer hosts of {} to {:?}", key, names);
            self.event(
                &svc,
                EventType::Normal,
                REASON_UPDATED,
                &format!("Updated load balancer with new hosts {:?}", names),
            );
            let entry = self.cache_entry(key);
            let mut entry = entry.lock();
            entry.applied_nodes = names;
            entry.retry_delay = Duration::ZERO;
            return Ok(Action::Done);
        }

        if !has_cleanup_finalizer(&svc) && self.add_finalizer(key).await?.is_none() {
            debug!("Service {} is gone", key);
            return Ok(Action::Done);
        }

        self.event(&svc, EventType::Normal, REASON_ENSURING, "Ensuring load balancer");
        let ingress = match cloud.ensure_load_balancer(cluster, &svc, &nodes).await {
            Ok(status) => Some(sorted_ingress(Some(&status))),
            Err(e) if e.is_already_exists() => {
                debug!("Load balancer of {} already exists", key);
                None
            }
            Err(e) => {
                let delay = self.backoff(key);
                warn!("Failed to ensure load balancer of {}: {}; retrying in {:?}", key, e, delay);
                self.event(
                    &svc,
                    EventType::Warning,
                    REASON_SYNC_FAILED,
                    &format!("Error syncing load balancer: {}", e),
                );
                return Ok(Action::requeue(delay));
            }
        };

        if let Some(ingress) = ingress {
            if ingress != current_ingress(&svc) {
                self.write_ingress(key, ingress).await?;
            }
        }
        info!("Ensured load balancer of {}", key);
        self.event(&svc, EventType::Normal, REASON_ENSURED, "Ensured load balancer");

        let entry = self.cache_entry(key);
        let mut entry = entry.lock();
        entry.last_applied = Some(svc);
        entry.applied_nodes = names;
        entry.retry_delay = Duration::ZERO;
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for ServiceController {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn name(&self) -> &str {
        CONTROLLER_SERVICE
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cloud) = self.ctx.cloud.clone() else {
            return Ok(Action::Done);
        };
        let svc = self.ctx.informers.services.store().get(key);

        match svc {
            Some(svc) if is_load_balancer(&svc) && !svc.is_terminating() => {
                self.sync_balancer(&cloud, key, svc).await
            }
            current => {
                let applied = match self.cached(key) {
                    Some(cached) => {
                        let last = cached.lock().last_applied.clone();
                        last
                    }
                    None => None,
                };
                // Not seen since start, but the finalizer or the status shows a balancer
                let target = applied.or_else(|| {
                    current
                        .clone()
                        .filter(|c| has_cleanup_finalizer(c) || !current_ingress(c).is_empty())
                });
                match target {
                    Some(target) => {
                        self.delete_balancer(&cloud, key, &target, current.as_deref()).await
                    }
                    None => {
                        self.cache.lock().remove(key);
                        Ok(Action::Done)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::CloudCall;
    use crate::testutil::{make_node, node_status, start, Harness};
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use std::collections::BTreeMap;

    fn make_service(name: &str) -> Service {
        let mut svc = Service::default();
        svc.metadata.name = Some(name.to_string());
        svc.metadata.namespace = Some("default".to_string());
        svc.spec = Some(ServiceSpec {
            type_: Some(TYPE_LOAD_BALANCER.to_string()),
            ports: Some(vec![
                ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::Int(8080)),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("https".to_string()),
                    port: 443,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        });
        svc
    }

    async fn ready_node(h: &Harness, name: &str) -> Node {
        let node = h.create(make_node(name, "z1")).await;
        let mut node = node;
        node.status = Some(node_status("True", start()));
        h.set_status(&node).await
    }

    async fn setup() -> (Harness, ServiceController, Service) {
        let h = Harness::new();
        let controller = ServiceController::new(h.ctx.clone());
        ready_node(&h, "n1").await;
        ready_node(&h, "n2").await;
        let svc = h.create(make_service("frontend")).await;
        h.sync().await;
        (h, controller, svc)
    }

    #[test]
    fn test_needs_update() {
        let mut a = make_service("frontend");
        a.metadata.uid = Some("u1".to_string());
        let mut b = a.clone();
        b.spec.as_mut().unwrap().ports.as_mut().unwrap().reverse();
        assert!(!needs_update(&a, &b));

        b.spec.as_mut().unwrap().external_ips = Some(vec!["10.0.0.2".into(), "10.0.0.1".into()]);
        a.spec.as_mut().unwrap().external_ips = Some(vec!["10.0.0.1".into(), "10.0.0.2".into()]);
        assert!(!needs_update(&a, &b));

        b.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(30080);
        assert!(needs_update(&a, &b));
        assert_eq!(port_signature(&a, false), port_signature(&b, false));

        let mut c = a.clone();
        c.metadata.annotations = Some(BTreeMap::from([("team".to_string(), "web".to_string())]));
        assert!(needs_update(&a, &c));

        let mut d = a.clone();
        d.status = Some(ServiceStatus::default());
        d.metadata.resource_version = Some("42".to_string());
        assert!(!needs_update(&a, &d));
    }

    #[test]
    fn test_node_port_only_matters_for_load_balancers() {
        let mut a = make_service("internal");
        a.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        let mut b = a.clone();
        b.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(30080);
        assert!(!needs_update(&a, &b));

        // Turning it into a balancer is a change regardless of ports
        let mut c = b.clone();
        c.spec.as_mut().unwrap().type_ = Some(TYPE_LOAD_BALANCER.to_string());
        assert!(needs_update(&b, &c));

        let mut d = c.clone();
        d.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(30081);
        assert!(needs_update(&c, &d));
    }

    #[tokio::test]
    async fn test_node_port_change_on_cluster_ip_is_not_enqueued() {
        let h = Harness::new();
        let controller = ServiceController::new(h.ctx.clone());
        let mut svc = make_service("internal");
        svc.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        h.create(svc).await;
        h.sync().await;

        let queue = Arc::new(WorkQueue::new("test"));
        controller.register(&queue);
        assert!(queue.is_empty());

        let mut stored: Service = h.get("default", "internal").await.unwrap();
        stored.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(30080);
        h.ctx.client.update(&stored).await.unwrap();
        h.sync().await;
        assert!(queue.is_empty());
    }

    #[test]
    fn test_retry_delay() {
        let min = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        let mut delay = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..8 {
            delay = next_retry_delay(delay, min, max);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[tokio::test]
    async fn test_unchanged_service_is_not_resynced() {
        let (h, controller, svc) = setup().await;
        let key = svc.object_key();

        controller.reconcile(&key).await.unwrap();
        assert_eq!(
            h.cloud.calls().await,
            vec![CloudCall::Ensure {
                name: crate::cloud::load_balancer_name(&svc),
                nodes: vec!["n1".to_string(), "n2".to_string()],
            }]
        );
        let stored: Service = h.get("default", "frontend").await.unwrap();
        assert_eq!(current_ingress(&stored)[0].ip.as_deref(), Some("203.0.113.5"));
        assert!(has_cleanup_finalizer(&stored));
        assert!(h.recorder.has(REASON_ENSURED));

        h.sync().await;
        h.cloud.clear_calls().await;
        let revision = h.store.current_revision();
        assert_eq!(controller.reconcile(&key).await.unwrap(), Action::Done);
        assert!(h.cloud.calls().await.is_empty());
        assert_eq!(h.store.current_revision(), revision);
    }

    #[tokio::test]
    async fn test_node_change_updates_hosts() {
        let (h, controller, svc) = setup().await;
        let key = svc.object_key();
        controller.reconcile(&key).await.unwrap();

        ready_node(&h, "n3").await;
        let mut n1 = h.get_node("n1").await.unwrap();
        n1.spec.as_mut().unwrap().unschedulable = Some(true);
        h.ctx.client.update(&n1).await.unwrap();
        h.sync().await;
        h.cloud.clear_calls().await;

        controller.reconcile(&key).await.unwrap();
        let lb_name = crate::cloud::load_balancer_name(&svc);
        assert_eq!(
            h.cloud.calls().await,
            vec![CloudCall::Update {
                name: lb_name,
                nodes: vec!["n2".to_string(), "n3".to_string()],
            }]
        );
        assert!(h.recorder.has(REASON_UPDATED));
    }

    #[tokio::test]
    async fn test_failures_back_off() {
        let (h, controller, svc) = setup().await;
        let key = svc.object_key();

        h.cloud.fail_next(2).await;
        assert_eq!(
            controller.reconcile(&key).await.unwrap(),
            Action::RequeueAfter(Duration::from_secs(5))
        );
        assert_eq!(
            controller.reconcile(&key).await.unwrap(),
            Action::RequeueAfter(Duration::from_secs(10))
        );
        assert!(h.recorder.has(REASON_SYNC_FAILED));

        assert_eq!(controller.reconcile(&key).await.unwrap(), Action::Done);
        assert_eq!(controller.cached(&key).unwrap().lock().retry_delay, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_type_change_deletes_balancer() {
        let (h, controller, svc) = setup().await;
        let key = svc.object_key();
        controller.reconcile(&key).await.unwrap();
        assert_eq!(h.cloud.balancer_count().await, 1);

        let mut stored: Service = h.get("default", "frontend").await.unwrap();
        stored.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        h.ctx.client.update(&stored).await.unwrap();
        h.sync().await;

        controller.reconcile(&key).await.unwrap();
        assert_eq!(h.cloud.balancer_count().await, 0);
        assert!(h.recorder.has(REASON_DELETED));
        let stored: Service = h.get("default", "frontend").await.unwrap();
        assert!(current_ingress(&stored).is_empty());
        assert!(!has_cleanup_finalizer(&stored));
    }

    #[tokio::test]
    async fn test_deleted_service_deletes_balancer() {
        let (h, controller, svc) = setup().await;
        let key = svc.object_key();
        controller.reconcile(&key).await.unwrap();

        h.ctx
            .client
            .delete::<Service>(&key, &helmsman_storage::DeleteOptions::default())
            .await
            .unwrap();
        let held: Service = h.get("default", "frontend").await.unwrap();
        assert!(held.is_terminating());
        h.sync().await;

        controller.reconcile(&key).await.unwrap();
        assert_eq!(h.cloud.balancer_count().await, 0);
        assert!(controller.cached(&key).is_none());
        assert!(h.get::<Service>("default", "frontend").await.is_none());
    }

    #[tokio::test]
    async fn test_service_deleted_while_stopped_is_cleaned_up() {
        let (h, controller, svc) = setup().await;
        let key = svc.object_key();
        controller.reconcile(&key).await.unwrap();
        assert_eq!(h.cloud.balancer_count().await, 1);
        drop(controller);

        h.ctx
            .client
            .delete::<Service>(&key, &helmsman_storage::DeleteOptions::default())
            .await
            .unwrap();

        // A fresh controller has no memory of the balancer
        let restarted = ServiceController::new(h.ctx.clone());
        let queue = Arc::new(WorkQueue::new("test"));
        h.sync().await;
        restarted.register(&queue);
        assert_eq!(queue.len(), 1);
        h.cloud.clear_calls().await;

        restarted.reconcile(&key).await.unwrap();
        assert_eq!(
            h.cloud.calls().await,
            vec![CloudCall::Delete {
                name: crate::cloud::load_balancer_name(&svc),
            }]
        );
        assert_eq!(h.cloud.balancer_count().await, 0);
        assert!(h.recorder.has(REASON_DELETED));
        assert!(h.get::<Service>("default", "frontend").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_source_ranges() {
        let h = Harness::new();
        let controller = ServiceController::new(h.ctx.clone());
        let mut svc = make_service("frontend");
        svc.spec.as_mut().unwrap().load_balancer_source_ranges = Some(vec!["10.0.0.0/40".to_string()]);
        let svc = h.create(svc).await;
        h.sync().await;

        let err = controller.reconcile(&svc.object_key()).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidSpec { .. }));
        assert!(h.recorder.has(REASON_INVALID_SOURCE_RANGES));
        assert!(h.cloud.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_node_set_change_enqueues_balancers() {
        let (h, controller, _svc) = setup().await;
        let mut other = make_service("internal");
        other.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        h.create(other).await;
        h.sync().await;

        let queue = Arc::new(WorkQueue::new("test"));
        controller.register(&queue);
        assert_eq!(queue.len(), 1);
        let key = queue.get().await.unwrap();
        queue.done(&key);

        // Same eligible set: nothing to do
        h.sync().await;
        assert!(queue.is_empty());

        ready_node(&h, "n3").await;
        h.sync().await;
        assert_eq!(queue.len(), 1);
    }
}
