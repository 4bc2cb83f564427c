//! Informers and clients shared by all controllers.

use crate::cloud::CloudClient;
use crate::config::ControllerManagerConfig;
use helmsman_core::{Clock, Endpoints, Job, Node, Pod, Result, Service, StatefulSet};
use helmsman_runtime::{
    index_by_controller_uid, index_by_namespace, index_pods_by_node, ApiClient, ControllerConfig,
    EventRecorder, Informer, InformerConfig, Store, Synced, INDEX_CONTROLLER_UID, INDEX_NAMESPACE,
    INDEX_NODE_NAME,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One informer per kind, shared by every controller that needs it
pub struct SharedInformers {
    pub pods: Arc<Informer<Pod>>,
    pub nodes: Arc<Informer<Node>>,
    pub services: Arc<Informer<Service>>,
    pub endpoints: Arc<Informer<Endpoints>>,
    pub statefulsets: Arc<Informer<StatefulSet>>,
    pub jobs: Arc<Informer<Job>>,
}

impl SharedInformers {
    pub fn new(client: &ApiClient, config: InformerConfig) -> Self {
        let pod_store = Store::new()
            .with_indexer(INDEX_NAMESPACE, index_by_namespace())
            .with_indexer(INDEX_NODE_NAME, index_pods_by_node())
            .with_indexer(INDEX_CONTROLLER_UID, index_by_controller_uid());
        let service_store = Store::new().with_indexer(INDEX_NAMESPACE, index_by_namespace());
        let statefulset_store = Store::new().with_indexer(INDEX_NAMESPACE, index_by_namespace());

        Self {
            pods: Arc::new(Informer::with_store(client.clone(), config.clone(), Arc::new(pod_store))),
            nodes: Arc::new(Informer::new(client.clone(), config.clone())),
            services: Arc::new(Informer::with_store(
                client.clone(),
                config.clone(),
                Arc::new(service_store),
            )),
            endpoints: Arc::new(Informer::new(client.clone(), config.clone())),
            statefulsets: Arc::new(Informer::with_store(
                client.clone(),
                config.clone(),
                Arc::new(statefulset_store),
            )),
            jobs: Arc::new(Informer::new(client.clone(), config)),
        }
    }

    /// Start every informer on `tasks`
    pub fn spawn_all(&self, tasks: &mut JoinSet<()>, token: &CancellationToken) {
        macro_rules! spawn {
            ($informer:expr) => {{
                let informer = $informer.clone();
                let token = token.clone();
                tasks.spawn(async move { informer.run(token).await });
            }};
        }
        spawn!(self.pods);
        spawn!(self.nodes);
        spawn!(self.services);
        spawn!(self.endpoints);
        spawn!(self.statefulsets);
        spawn!(self.jobs);
    }

    /// List every kind once; used by tests and tools that do not watch
    pub async fn list_all(&self) -> Result<()> {
        self.pods.list_into_store().await?;
        self.nodes.list_into_store().await?;
        self.services.list_into_store().await?;
        self.endpoints.list_into_store().await?;
        self.statefulsets.list_into_store().await?;
        self.jobs.list_into_store().await?;
        Ok(())
    }
}

/// Upcast for the cache-sync barrier
pub fn synced<T: Send + Sync + 'static>(informer: &Arc<T>) -> Arc<dyn Synced>
where
    T: Synced,
{
    informer.clone()
}

/// Everything a controller needs besides its own state
#[derive(Clone)]
pub struct ControllerContext {
    pub client: ApiClient,
    pub recorder: Arc<dyn EventRecorder>,
    pub clock: Arc<dyn Clock>,
    pub informers: Arc<SharedInformers>,
    pub cloud: Option<CloudClient>,
    pub config: Arc<ControllerManagerConfig>,
}

impl ControllerContext {
    /// Substrate settings for a controller running `workers` workers
    pub fn controller_config(&self, workers: usize) -> ControllerConfig {
        ControllerConfig {
            workers: workers.max(1),
            cache_sync_timeout: self.config.cache_sync_timeout(),
            reconcile_timeout: self.config.reconcile_timeout(),
            max_conflict_retries: self.config.max_conflict_retries,
            ..Default::default()
        }
    }
}
