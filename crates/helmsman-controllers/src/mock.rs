use crate::cloud::{load_balancer_name, CloudError, CloudProvider, CloudResult};
use async_trait::async_trait;
use helmsman_core::{Node, Resource, Service};
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, NodeAddress};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A balancer as the mock provider holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBalancer {
    pub service: String,
    pub nodes: BTreeSet<String>,
    pub ingress_ip: String,
}

/// One recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    Ensure { name: String, nodes: Vec<String> },
    Update { name: String, nodes: Vec<String> },
    Delete { name: String },
    InstanceExists { provider_id: String },
    NodeAddresses { node: String },
}

#[derive(Debug, Default)]
struct MockState {
    balancers: HashMap<String, MockBalancer>,
    next_ip: u8,
    calls: Vec<CloudCall>,
    missing_instances: HashSet<String>,
    addresses: HashMap<String, Vec<NodeAddress>>,
    failures: u32,
}

/// In-memory cloud provider for development and tests
///
/// Balancers get addresses from 203.0.113.0/24 in creation order. Every
/// instance exists unless removed with [`MockCloud::remove_instance`].
#[derive(Clone, Default)]
pub struct MockCloud {
    state: Arc<RwLock<MockState>>,
}

fn node_names(nodes: &[Node]) -> Vec<String> {
    let mut names: Vec<String> = nodes.iter().map(|n| n.name().to_string()).collect();
    names.sort();
    names
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<CloudCall> {
        self.state.read().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.write().await.calls.clear();
    }

    pub async fn balancer(&self, service: &Service) -> Option<MockBalancer> {
        self.state
            .read()
            .await
            .balancers
            .get(&load_balancer_name(service))
            .cloned()
    }

    pub async fn balancer_count(&self) -> usize {
        self.state.read().await.balancers.len()
    }

    pub async fn remove_instance(&self, provider_id: &str) {
        self.state
            .write()
            .await
            .missing_instances
            .insert(provider_id.to_string());
    }

    pub async fn set_addresses(&self, node: &str, addresses: Vec<NodeAddress>) {
        self.state
            .write()
            .await
            .addresses
            .insert(node.to_string(), addresses);
    }

    /// Make the next `n` balancer or address calls fail
    pub async fn fail_next(&self, n: u32) {
        self.state.write().await.failures = n;
    }

    fn take_failure(state: &mut MockState) -> CloudResult<()> {
        if state.failures > 0 {
            state.failures -= 1;
            return Err(CloudError::provider("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    fn name(&self) -> &str {
        "mock"
    }

    async fn ensure_load_balancer(
        &self,
        _cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> CloudResult<LoadBalancerStatus> {
        let name = load_balancer_name(service);
        let names = node_names(nodes);
        let mut state = self.state.write().await;
        state.calls.push(CloudCall::Ensure {
            name: name.clone(),
            nodes: names.clone(),
        });
        Self::take_failure(&mut state)?;

        let ip = match state.balancers.get(&name) {
            Some(existing) => existing.ingress_ip.clone(),
            None => {
                state.next_ip = state.next_ip.wrapping_add(1).max(5);
                format!("203.0.113.{}", state.next_ip)
            }
        };
        state.balancers.insert(
            name.clone(),
            MockBalancer {
                service: service.object_key().to_string(),
                nodes: names.into_iter().collect(),
                ingress_ip: ip.clone(),
            },
        );
        debug!("Mock: ensured load balancer {} at {}", name, ip);

        Ok(LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                ip: Some(ip),
                ..Default::default()
            }]),
        })
    }

    async fn update_load_balancer(&self, _cluster_name: &str, service: &Service, nodes: &[Node]) -> CloudResult<()> {
        let name = load_balancer_name(service);
        let names = node_names(nodes);
        let mut state = self.state.write().await;
        state.calls.push(CloudCall::Update {
            name: name.clone(),
            nodes: names.clone(),
        });
        Self::take_failure(&mut state)?;

        let balancer = state
            .balancers
            .get_mut(&name)
            .ok_or_else(|| CloudError::provider(format!("load balancer {} does not exist", name)))?;
        balancer.nodes = names.into_iter().collect();
        debug!("Mock: updated load balancer {}", name);
        Ok(())
    }

    async fn ensure_load_balancer_deleted(&self, _cluster_name: &str, service: &Service) -> CloudResult<()> {
        let name = load_balancer_name(service);
        let mut state = self.state.write().await;
        state.calls.push(CloudCall::Delete { name: name.clone() });
        Self::take_failure(&mut state)?;
        state.balancers.remove(&name);
        debug!("Mock: deleted load balancer {}", name);
        Ok(())
    }

    async fn instance_exists_by_provider_id(&self, provider_id: &str) -> CloudResult<bool> {
        let mut state = self.state.write().await;
        state.calls.push(CloudCall::InstanceExists {
            provider_id: provider_id.to_string(),
        });
        Ok(!state.missing_instances.contains(provider_id))
    }

    async fn node_addresses(&self, node_name: &str) -> CloudResult<Vec<NodeAddress>> {
        let mut state = self.state.write().await;
        state.calls.push(CloudCall::NodeAddresses {
            node: node_name.to_string(),
        });
        Self::take_failure(&mut state)?;
        state
            .addresses
            .get(node_name)
            .cloned()
            .ok_or_else(|| CloudError::instance_not_found(node_name))
    }
}
