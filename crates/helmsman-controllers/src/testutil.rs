//! Fixtures shared by the controller tests.

use crate::cloud::CloudClient;
use crate::config::ControllerManagerConfig;
use crate::context::{ControllerContext, SharedInformers};
use crate::mock::MockCloud;
use chrono::{DateTime, TimeZone, Utc};
use helmsman_core::{FakeClock, Node, ObjectKey, Pod, Resource};
use helmsman_runtime::{ApiClient, FakeRecorder, InformerConfig};
use helmsman_storage::{RedbBackend, ResourceStore};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, NodeCondition, NodeSpec, NodeStatus, PodCondition, PodSpec,
    PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<ResourceStore>,
    pub clock: Arc<FakeClock>,
    pub recorder: Arc<FakeRecorder>,
    pub cloud: MockCloud,
    pub ctx: ControllerContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerManagerConfig::default())
    }

    pub fn with_config(config: ControllerManagerConfig) -> Self {
        let clock = Arc::new(FakeClock::new(start()));
        let kv = Arc::new(RedbBackend::in_memory().unwrap());
        let store = Arc::new(ResourceStore::new(kv, clock.clone()).unwrap());
        let client = ApiClient::new(store.clone());
        let recorder = Arc::new(FakeRecorder::new());
        let cloud = MockCloud::new();
        let informers = Arc::new(SharedInformers::new(&client, InformerConfig::default()));

        let ctx = ControllerContext {
            client,
            recorder: recorder.clone(),
            clock: clock.clone(),
            informers,
            cloud: Some(CloudClient::new(Arc::new(cloud.clone()))),
            config: Arc::new(config),
        };

        Self {
            store,
            clock,
            recorder,
            cloud,
            ctx,
        }
    }

    /// Refill every informer cache from storage
    pub async fn sync(&self) {
        self.ctx.informers.list_all().await.unwrap();
    }

    pub async fn create<T: Resource>(&self, object: T) -> T {
        self.ctx.client.create(&object).await.unwrap()
    }

    pub async fn get<T: Resource>(&self, namespace: &str, name: &str) -> Option<T> {
        self.ctx
            .client
            .get_opt(&ObjectKey::new(namespace, name))
            .await
            .unwrap()
    }

    pub async fn get_node(&self, name: &str) -> Option<Node> {
        self.ctx
            .client
            .get_opt(&ObjectKey::cluster_scoped(name))
            .await
            .unwrap()
    }

    pub async fn set_status<T: Resource>(&self, object: &T) -> T {
        self.ctx.client.update_status(object).await.unwrap()
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(chrono::Duration::seconds(seconds));
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn make_pod(namespace: &str, name: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod.metadata.namespace = Some(namespace.to_string());
    pod.spec = Some(PodSpec {
        containers: vec![Container {
            name: "app".to_string(),
            image: Some("nginx:1.27".to_string()),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: 8080,
                ..Default::default()
            }]),
            ..Default::default()
        }],
        ..Default::default()
    });
    pod
}

pub fn running_status(ready: bool, ip: &str) -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        pod_ip: (!ip.is_empty()).then(|| ip.to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub fn make_node(name: &str, zone: &str) -> Node {
    let mut node = Node::default();
    node.metadata.name = Some(name.to_string());
    if !zone.is_empty() {
        node.metadata.labels = Some(labels(&[(helmsman_core::resources::node::LABEL_ZONE, zone)]));
    }
    node.spec = Some(NodeSpec {
        provider_id: Some(format!("mock://{}", name)),
        ..Default::default()
    });
    node
}

/// Node status with a `Ready` condition whose heartbeat is `heartbeat`
pub fn node_status(ready: &str, heartbeat: DateTime<Utc>) -> NodeStatus {
    NodeStatus {
        conditions: Some(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: ready.to_string(),
            last_heartbeat_time: Some(Time(heartbeat)),
            last_transition_time: Some(Time(heartbeat)),
            ..Default::default()
        }]),
        ..Default::default()
    }
}
