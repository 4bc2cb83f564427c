//! Endpoints controller.
//!
//! Materializes one Endpoints object per selector-bearing Service from the
//! pods that currently match it. The subsets are packed into a canonical
//! form, so equal pod sets always produce identical objects and unchanged
//! services are never rewritten.

use crate::config::CONTROLLER_ENDPOINTS;
use crate::context::{synced, ControllerContext};
use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use helmsman_core::annotations;
use helmsman_core::resources::pod;
use helmsman_core::{Endpoints, LabelSelector, ObjectKey, Pod, Resource, Service};
use helmsman_runtime::{
    Action, CancellationToken, Controller, EventHandlerFns, Reconciler, Store, WorkQueue,
    INDEX_NAMESPACE,
};
use helmsman_storage::DeleteOptions;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, ObjectReference, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

fn selector(service: &Service) -> Option<&BTreeMap<String, String>> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .filter(|s| !s.is_empty())
}

/// Terminal pods that will never run again
fn is_terminal(p: &Pod) -> bool {
    let restart = p
        .spec
        .as_ref()
        .and_then(|s| s.restart_policy.as_deref())
        .unwrap_or("Always");
    match (pod::phase(p), restart) {
        (pod::PHASE_FAILED | pod::PHASE_SUCCEEDED, "Never") => true,
        (pod::PHASE_SUCCEEDED, "OnFailure") => true,
        _ => false,
    }
}

fn container_ports(p: &Pod) -> Vec<&k8s_openapi::api::core::v1::ContainerPort> {
    p.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .collect()
}

/// The pod port a service port forwards to, if the pod has one
pub fn resolve_target_port(service_port: &ServicePort, p: &Pod) -> Option<i32> {
    match &service_port.target_port {
        None => Some(service_port.port),
        Some(IntOrString::Int(port)) => Some(*port),
        Some(IntOrString::String(name)) => {
            let ports = container_ports(p);
            ports
                .iter()
                .find(|cp| cp.name.as_deref() == Some(name.as_str()))
                .map(|cp| cp.container_port)
                .or_else(|| match ports.as_slice() {
                    [only] => Some(only.container_port),
                    _ => None,
                })
        }
    }
}

fn endpoint_address(service: &Service, p: &Pod) -> EndpointAddress {
    let spec = p.spec.as_ref();
    let hostname = spec
        .filter(|s| s.subdomain.as_deref() == Some(service.name()))
        .and_then(|s| s.hostname.clone())
        .filter(|h| !h.is_empty());
    let node_name = pod::node_name(p);
    EndpointAddress {
        ip: pod::pod_ip(p).to_string(),
        hostname,
        node_name: (!node_name.is_empty()).then(|| node_name.to_string()),
        target_ref: Some(ObjectReference {
            kind: Some(Pod::KIND.to_string()),
            namespace: p.metadata.namespace.clone(),
            name: p.metadata.name.clone(),
            uid: p.metadata.uid.clone(),
            ..Default::default()
        }),
    }
}

/// One unpacked subset per eligible pod
pub fn build_subsets(service: &Service, pods: &[Arc<Pod>]) -> Vec<EndpointSubset> {
    let service_ports: &[ServicePort] = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default();
    let publish_not_ready = service
        .spec
        .as_ref()
        .and_then(|s| s.publish_not_ready_addresses)
        .unwrap_or(false)
        || annotations::tolerates_unready_endpoints(service);

    let mut subsets = Vec::new();
    for p in pods {
        if pod::pod_ip(p).is_empty() || p.is_terminating() || is_terminal(p) {
            continue;
        }
        let ports: Vec<EndpointPort> = service_ports
            .iter()
            .filter_map(|sp| {
                let port = resolve_target_port(sp, p);
                if port.is_none() {
                    debug!("Pod {} has no port for {:?}", p.object_key(), sp.name);
                }
                Some(EndpointPort {
                    name: sp.name.clone(),
                    port: port?,
                    protocol: Some(sp.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
                    app_protocol: sp.app_protocol.clone(),
                })
            })
            .collect();
        if ports.is_empty() && !service_ports.is_empty() {
            continue;
        }

        let address = endpoint_address(service, p);
        let (ready, not_ready) = if publish_not_ready || pod::is_ready(p) {
            (vec![address], None)
        } else {
            (Vec::new(), Some(vec![address]))
        };
        subsets.push(EndpointSubset {
            addresses: Some(ready),
            not_ready_addresses: not_ready,
            ports: Some(ports),
        });
    }
    subsets
}

type PortKey = (i32, String, String);
type AddressKey = (String, String);

fn port_key(p: &EndpointPort) -> PortKey {
    (
        p.port,
        p.protocol.clone().unwrap_or_default(),
        p.name.clone().unwrap_or_default(),
    )
}

fn address_key(a: &EndpointAddress) -> AddressKey {
    let name = a
        .target_ref
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_default();
    (a.ip.clone(), name)
}

#[derive(Default)]
struct Group {
    ports: Vec<EndpointPort>,
    ready: BTreeMap<AddressKey, EndpointAddress>,
    not_ready: BTreeMap<AddressKey, EndpointAddress>,
}

/// Canonical form of `subsets`.
///
/// Subsets with the same port set are merged; addresses are sorted by IP
/// then pod name, ports by `(port, protocol, name)`, and subsets by their
/// ports. An address that is ready anywhere in a group is ready.
pub fn pack(subsets: Vec<EndpointSubset>) -> Vec<EndpointSubset> {
    let mut groups: BTreeMap<Vec<PortKey>, Group> = BTreeMap::new();

    for subset in subsets {
        let mut ports = subset.ports.unwrap_or_default();
        ports.sort_by_key(port_key);
        ports.dedup_by(|a, b| port_key(a) == port_key(b));
        let key: Vec<PortKey> = ports.iter().map(port_key).collect();

        let group = groups.entry(key).or_default();
        group.ports = ports;
        for a in subset.addresses.unwrap_or_default() {
            group.ready.insert(address_key(&a), a);
        }
        for a in subset.not_ready_addresses.unwrap_or_default() {
            group.not_ready.entry(address_key(&a)).or_insert(a);
        }
    }

    groups
        .into_values()
        .filter_map(|mut group| {
            group.not_ready.retain(|k, _| !group.ready.contains_key(k));
            if group.ready.is_empty() && group.not_ready.is_empty() {
                return None;
            }
            let nonempty = |v: Vec<EndpointAddress>| (!v.is_empty()).then_some(v);
            Some(EndpointSubset {
                addresses: nonempty(group.ready.into_values().collect()),
                not_ready_addresses: nonempty(group.not_ready.into_values().collect()),
                ports: (!group.ports.is_empty()).then_some(group.ports),
            })
        })
        .collect()
}

/// Keys of the selector-bearing services in the pod's namespace that select it
fn services_for_pod(services: &Store<Service>, p: &Pod) -> Vec<ObjectKey> {
    services
        .by_index(INDEX_NAMESPACE, p.namespace())
        .iter()
        .filter(|svc| {
            selector(svc)
                .map(|sel| LabelSelector::from_map(sel).matches(p.labels()))
                .unwrap_or(false)
        })
        .map(|svc| svc.object_key())
        .collect()
}

fn route_pod(
    queue: Arc<WorkQueue<ObjectKey>>,
    services: Arc<Store<Service>>,
) -> impl Fn(&Arc<Pod>) + Send + Sync + 'static {
    move |p| {
        for key in services_for_pod(&services, p) {
            queue.add(key);
        }
    }
}

fn enqueue_key<T: Resource>(queue: Arc<WorkQueue<ObjectKey>>) -> impl Fn(&Arc<T>) + Send + Sync + 'static {
    move |obj| queue.add(obj.object_key())
}

pub struct EndpointsController {
    ctx: ControllerContext,
}

impl EndpointsController {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    pub fn register(&self, queue: &Arc<WorkQueue<ObjectKey>>) {
        let informers = &self.ctx.informers;
        informers.services.add_handler(Arc::new(
            EventHandlerFns::<Service>::new()
                .on_add(enqueue_key::<Service>(queue.clone()))
                .on_update({
                    let enqueue = enqueue_key::<Service>(queue.clone());
                    move |_: &Arc<Service>, svc: &Arc<Service>| enqueue(svc)
                })
                .on_delete(enqueue_key::<Service>(queue.clone())),
        ));

        let services = informers.services.store().clone();
        informers.pods.add_handler(Arc::new(
            EventHandlerFns::<Pod>::new()
                .on_add(route_pod(queue.clone(), services.clone()))
                .on_update({
                    let route = route_pod(queue.clone(), services.clone());
                    move |old: &Arc<Pod>, new: &Arc<Pod>| {
                        if old.labels() != new.labels() {
                            route(old);
                        }
                        route(new);
                    }
                })
                .on_delete(route_pod(queue.clone(), services)),
        ));

        // Recreate endpoints removed behind our back
        informers.endpoints.add_handler(Arc::new(
            EventHandlerFns::<Endpoints>::new().on_delete(enqueue_key::<Endpoints>(queue.clone())),
        ));
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let queue = Arc::new(WorkQueue::new(CONTROLLER_ENDPOINTS));
        self.register(&queue);
        let informers = vec![
            synced(&self.ctx.informers.services),
            synced(&self.ctx.informers.pods),
            synced(&self.ctx.informers.endpoints),
        ];
        let config = self
            .ctx
            .controller_config(self.ctx.config.endpoints.concurrent_syncs);
        let controller = Arc::new(Controller::new(Arc::new(self), queue, config));
        controller.run(informers, token).await?;
        Ok(())
    }

    async fn delete_endpoints(&self, key: &ObjectKey) -> Result<()> {
        match self
            .ctx
            .client
            .delete::<Endpoints>(key, &DeleteOptions::default())
            .await
        {
            Ok(_) => {
                info!("Deleted endpoints {}", key);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &ObjectKey, existing: Option<Endpoints>, desired: Endpoints) -> Result<()> {
        let client = &self.ctx.client;
        let mut current = match existing {
            Some(current) => current,
            None => match client.create(&desired).await {
                Ok(_) => {
                    info!("Created endpoints {}", key);
                    return Ok(());
                }
                // The cache was behind; update what is stored instead
                Err(e) if e.is_already_exists() => match client.get_opt::<Endpoints>(key).await? {
                    Some(stored) => stored,
                    None => return Ok(()),
                },
                Err(e) => return Err(e.into()),
            },
        };

        current.subsets = desired.subsets;
        current.metadata.labels = desired.metadata.labels;
        client.update(&current).await?;
        debug!("Updated endpoints {}", key);
        Ok(())
    }
}

#[async_trait]
impl Reconciler for EndpointsController {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn name(&self) -> &str {
        CONTROLLER_ENDPOINTS
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let informers = &self.ctx.informers;
        let Some(svc) = informers.services.store().get(key) else {
            self.delete_endpoints(key).await?;
            return Ok(Action::Done);
        };
        let Some(selector) = selector(&svc) else {
            debug!("Service {} has no selector; leaving its endpoints alone", key);
            return Ok(Action::Done);
        };
        if svc.is_terminating() {
            return Ok(Action::Done);
        }

        let selector = LabelSelector::from_map(selector);
        let pods: Vec<Arc<Pod>> = informers
            .pods
            .store()
            .by_index(INDEX_NAMESPACE, key.namespace.as_str())
            .into_iter()
            .filter(|p| selector.matches(p.labels()))
            .collect();
        let subsets = pack(build_subsets(&svc, &pods));

        let existing = informers.endpoints.store().get(key);
        if let Some(current) = &existing {
            let current_subsets = current.subsets.clone().unwrap_or_default();
            if current_subsets == subsets && current.metadata.labels == svc.metadata.labels {
                debug!("Endpoints {} are up to date", key);
                return Ok(Action::Done);
            }
        }

        let mut desired = Endpoints::default();
        desired.metadata.name = svc.metadata.name.clone();
        desired.metadata.namespace = svc.metadata.namespace.clone();
        desired.metadata.labels = svc.metadata.labels.clone();
        desired.subsets = Some(subsets);

        self.write(key, existing.map(|e| (*e).clone()), desired).await?;
        Ok(Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{labels, make_pod, running_status, Harness};
    use k8s_openapi::api::core::v1::ServiceSpec;

    fn make_service(selector: &[(&str, &str)], target: IntOrString) -> Service {
        let mut svc = Service::default();
        svc.metadata.name = Some("web".to_string());
        svc.metadata.namespace = Some("default".to_string());
        svc.metadata.labels = Some(labels(&[("tier", "frontend")]));
        svc.spec = Some(ServiceSpec {
            selector: (!selector.is_empty()).then(|| labels(selector)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(target),
                ..Default::default()
            }]),
            ..Default::default()
        });
        svc
    }

    fn web_pod(name: &str, ready: bool, ip: &str) -> Pod {
        let mut p = make_pod("default", name);
        p.metadata.labels = Some(labels(&[("app", "web")]));
        p.status = Some(running_status(ready, ip));
        p
    }

    fn addresses(v: &Option<Vec<EndpointAddress>>) -> Vec<String> {
        v.iter().flatten().map(|a| a.ip.clone()).collect()
    }

    #[test]
    fn test_ready_and_not_ready_share_a_subset() {
        let svc = make_service(&[("app", "web")], IntOrString::Int(80));
        let pods = vec![
            Arc::new(web_pod("p1", true, "1.1.1.1")),
            Arc::new(web_pod("p2", false, "1.1.1.2")),
        ];
        let subsets = pack(build_subsets(&svc, &pods));
        assert_eq!(subsets.len(), 1);
        assert_eq!(addresses(&subsets[0].addresses), vec!["1.1.1.1"]);
        assert_eq!(addresses(&subsets[0].not_ready_addresses), vec!["1.1.1.2"]);
        let ports = subsets[0].ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
        assert_eq!(ports[0].port, 80);
    }

    #[test]
    fn test_pack_is_canonical() {
        let svc = make_service(&[("app", "web")], IntOrString::String("http".to_string()));
        let mut other = web_pod("c", true, "10.0.0.9");
        other.spec.as_mut().unwrap().containers[0].ports.as_mut().unwrap()[0].container_port = 9090;
        let pods: Vec<Arc<Pod>> = vec![
            Arc::new(web_pod("b", true, "10.0.0.2")),
            Arc::new(other),
            Arc::new(web_pod("a", false, "10.0.0.1")),
            Arc::new(web_pod("d", true, "10.0.0.3")),
        ];
        let packed = pack(build_subsets(&svc, &pods));
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[0].ports.as_ref().unwrap()[0].port, 8080);
        assert_eq!(addresses(&packed[0].addresses), vec!["10.0.0.2", "10.0.0.3"]);
        assert_eq!(packed[1].ports.as_ref().unwrap()[0].port, 9090);

        assert_eq!(pack(packed.clone()), packed);

        let mut reversed = pods.clone();
        reversed.reverse();
        assert_eq!(pack(build_subsets(&svc, &reversed)), packed);
    }

    #[test]
    fn test_excluded_pods() {
        let svc = make_service(&[("app", "web")], IntOrString::Int(80));
        let no_ip = web_pod("no-ip", true, "");
        let mut terminating = web_pod("terminating", true, "10.0.0.2");
        terminating.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        let mut done = web_pod("done", true, "10.0.0.3");
        done.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        done.spec.as_mut().unwrap().restart_policy = Some("OnFailure".to_string());
        let mut failed_always = web_pod("restarting", true, "10.0.0.4");
        failed_always.status.as_mut().unwrap().phase = Some("Failed".to_string());

        let pods: Vec<Arc<Pod>> = [no_ip, terminating, done, failed_always]
            .into_iter()
            .map(Arc::new)
            .collect();
        let packed = pack(build_subsets(&svc, &pods));
        assert_eq!(packed.len(), 1);
        assert_eq!(addresses(&packed[0].addresses), vec!["10.0.0.4"]);
    }

    #[test]
    fn test_named_port_falls_back_to_only_port() {
        let svc = make_service(&[("app", "web")], IntOrString::String("metrics".to_string()));
        let p = web_pod("p", true, "10.0.0.1");
        let sp = &svc.spec.as_ref().unwrap().ports.as_ref().unwrap()[0];
        assert_eq!(resolve_target_port(sp, &p), Some(8080));

        let mut two = p.clone();
        two.spec.as_mut().unwrap().containers[0]
            .ports
            .as_mut()
            .unwrap()
            .push(k8s_openapi::api::core::v1::ContainerPort {
                name: Some("admin".to_string()),
                container_port: 9000,
                ..Default::default()
            });
        assert_eq!(resolve_target_port(sp, &two), None);
        assert!(build_subsets(&svc, &[Arc::new(two)]).is_empty());
    }

    #[test]
    fn test_publish_not_ready_and_hostname() {
        let mut svc = make_service(&[("app", "web")], IntOrString::Int(80));
        svc.spec.as_mut().unwrap().publish_not_ready_addresses = Some(true);
        let mut p = web_pod("web-0", false, "10.0.0.1");
        let spec = p.spec.as_mut().unwrap();
        spec.hostname = Some("web-0".to_string());
        spec.subdomain = Some("web".to_string());
        spec.node_name = Some("n1".to_string());

        let packed = pack(build_subsets(&svc, &[Arc::new(p)]));
        let address = &packed[0].addresses.as_ref().unwrap()[0];
        assert!(packed[0].not_ready_addresses.is_none());
        assert_eq!(address.hostname.as_deref(), Some("web-0"));
        assert_eq!(address.node_name.as_deref(), Some("n1"));
        assert_eq!(address.target_ref.as_ref().unwrap().name.as_deref(), Some("web-0"));
    }

    #[tokio::test]
    async fn test_reconcile_writes_once() {
        let h = Harness::new();
        let controller = EndpointsController::new(h.ctx.clone());
        let svc = h.create(make_service(&[("app", "web")], IntOrString::Int(80))).await;
        h.create(web_pod("p1", true, "1.1.1.1")).await;
        h.create(web_pod("p2", false, "1.1.1.2")).await;
        h.sync().await;

        let key = svc.object_key();
        controller.reconcile(&key).await.unwrap();
        let ep: Endpoints = h.get("default", "web").await.unwrap();
        let subsets = ep.subsets.as_ref().unwrap();
        assert_eq!(addresses(&subsets[0].addresses), vec!["1.1.1.1"]);
        assert_eq!(addresses(&subsets[0].not_ready_addresses), vec!["1.1.1.2"]);
        assert_eq!(ep.metadata.labels, svc.metadata.labels);

        h.sync().await;
        let revision = h.store.current_revision();
        controller.reconcile(&key).await.unwrap();
        assert_eq!(h.store.current_revision(), revision);
    }

    #[tokio::test]
    async fn test_selectorless_service_is_untouched() {
        let h = Harness::new();
        let controller = EndpointsController::new(h.ctx.clone());
        let svc = h.create(make_service(&[], IntOrString::Int(80))).await;

        let mut manual = Endpoints::default();
        manual.metadata.name = Some("web".to_string());
        manual.metadata.namespace = Some("default".to_string());
        manual.subsets = Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "192.0.2.10".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }]);
        h.create(manual.clone()).await;
        h.sync().await;

        let revision = h.store.current_revision();
        controller.reconcile(&svc.object_key()).await.unwrap();
        assert_eq!(h.store.current_revision(), revision);
        let ep: Endpoints = h.get("default", "web").await.unwrap();
        assert_eq!(ep.subsets, manual.subsets);
    }

    #[tokio::test]
    async fn test_deleted_service_removes_endpoints() {
        let h = Harness::new();
        let controller = EndpointsController::new(h.ctx.clone());
        let svc = h.create(make_service(&[("app", "web")], IntOrString::Int(80))).await;
        h.sync().await;
        let key = svc.object_key();
        controller.reconcile(&key).await.unwrap();
        assert!(h.get::<Endpoints>("default", "web").await.is_some());

        h.ctx
            .client
            .delete::<Service>(&key, &DeleteOptions::default())
            .await
            .unwrap();
        h.sync().await;
        controller.reconcile(&key).await.unwrap();
        assert!(h.get::<Endpoints>("default", "web").await.is_none());
    }

    #[tokio::test]
    async fn test_pod_changes_route_to_services() {
        let h = Harness::new();
        let controller = EndpointsController::new(h.ctx.clone());
        h.create(make_service(&[("app", "web")], IntOrString::Int(80))).await;
        h.sync().await;

        let queue = Arc::new(WorkQueue::new("test"));
        controller.register(&queue);
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());

        let mut other = make_pod("default", "db-0");
        other.metadata.labels = Some(labels(&[("app", "db")]));
        h.create(other).await;
        h.sync().await;
        assert!(queue.is_empty());

        h.create(web_pod("p1", true, "1.1.1.1")).await;
        h.sync().await;
        assert_eq!(queue.get().await, Some(ObjectKey::new("default", "web")));
    }
}
