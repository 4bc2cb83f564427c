//! Cloud provider seam used by the service and node lifecycle controllers.

use async_trait::async_trait;
use helmsman_core::{Node, Resource, Service};
use k8s_openapi::api::core::v1::{LoadBalancerStatus, NodeAddress};
use miette::Diagnostic;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default deadline for a single provider call
pub const DEFAULT_CLOUD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug, Diagnostic)]
pub enum CloudError {
    /// The instance behind a node no longer exists
    #[error("Instance not found: {id}")]
    #[diagnostic(code(helmsman::cloud::instance_not_found))]
    InstanceNotFound {
        #[allow(unused)]
        id: String,
    },

    #[error("Cloud resource already exists: {name}")]
    #[diagnostic(code(helmsman::cloud::already_exists))]
    AlreadyExists {
        #[allow(unused)]
        name: String,
    },

    #[error("Cloud call '{operation}' timed out after {timeout_secs}s")]
    #[diagnostic(
        code(helmsman::cloud::timeout),
        help("The provider is slow or unreachable; the call will be retried")
    )]
    Timeout {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        timeout_secs: u64,
    },

    #[error("Cloud provider error: {message}")]
    #[diagnostic(code(helmsman::cloud::provider))]
    Provider {
        #[allow(unused)]
        message: String,
    },
}

impl CloudError {
    pub fn instance_not_found(id: impl Into<String>) -> Self {
        Self::InstanceNotFound { id: id.into() }
    }

    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists { name: name.into() }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, Self::InstanceNotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// External load balancers and instance metadata
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Create or reconfigure the balancer for `service` targeting `nodes`
    async fn ensure_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> CloudResult<LoadBalancerStatus>;

    /// Change only the target nodes of an existing balancer
    async fn update_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> CloudResult<()>;

    /// Delete the balancer; succeeds if it does not exist
    async fn ensure_load_balancer_deleted(&self, cluster_name: &str, service: &Service) -> CloudResult<()>;

    async fn instance_exists_by_provider_id(&self, provider_id: &str) -> CloudResult<bool>;

    async fn node_addresses(&self, node_name: &str) -> CloudResult<Vec<NodeAddress>>;
}

/// Provider-side name of a service's balancer: `a` + uid without dashes,
/// at most 32 characters
pub fn load_balancer_name(service: &Service) -> String {
    let uid = service.uid().unwrap_or_default().replace('-', "");
    let mut name = format!("a{}", uid);
    name.truncate(32);
    name
}

/// Provider wrapper that puts a deadline on every call
#[derive(Clone)]
pub struct CloudClient {
    provider: Arc<dyn CloudProvider>,
    timeout: Duration,
}

impl CloudClient {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            timeout: DEFAULT_CLOUD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    async fn call<T>(&self, operation: &str, fut: impl Future<Output = CloudResult<T>>) -> CloudResult<T> {
        debug!("cloud {}: {}", self.provider.name(), operation);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::Timeout {
                operation: operation.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }

    pub async fn ensure_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> CloudResult<LoadBalancerStatus> {
        self.call(
            "ensure load balancer",
            self.provider.ensure_load_balancer(cluster_name, service, nodes),
        )
        .await
    }

    pub async fn update_load_balancer(&self, cluster_name: &str, service: &Service, nodes: &[Node]) -> CloudResult<()> {
        self.call(
            "update load balancer",
            self.provider.update_load_balancer(cluster_name, service, nodes),
        )
        .await
    }

    pub async fn ensure_load_balancer_deleted(&self, cluster_name: &str, service: &Service) -> CloudResult<()> {
        self.call(
            "delete load balancer",
            self.provider.ensure_load_balancer_deleted(cluster_name, service),
        )
        .await
    }

    pub async fn instance_exists_by_provider_id(&self, provider_id: &str) -> CloudResult<bool> {
        self.call(
            "instance exists",
            self.provider.instance_exists_by_provider_id(provider_id),
        )
        .await
    }

    pub async fn node_addresses(&self, node_name: &str) -> CloudResult<Vec<NodeAddress>> {
        self.call("node addresses", self.provider.node_addresses(node_name))
            .await
    }
}
