//! Controller manager: wires the shared informers, event sink and cloud
//! client, then runs every enabled controller until cancelled.

use crate::cloud::{CloudClient, CloudProvider};
use crate::config::{
    ControllerManagerConfig, ALL_CONTROLLERS, CONTROLLER_ENDPOINTS, CONTROLLER_NODE_LIFECYCLE,
    CONTROLLER_SERVICE, CONTROLLER_STATEFULSET, CONTROLLER_TTL_AFTER_FINISHED,
};
use crate::context::{ControllerContext, SharedInformers};
use crate::endpoints::EndpointsController;
use crate::error::Result;
use crate::node_lifecycle::NodeLifecycleController;
use crate::service::ServiceController;
use crate::statefulset::StatefulSetController;
use crate::ttl_after_finished::TtlAfterFinishedController;
use helmsman_core::Clock;
use helmsman_runtime::{ApiClient, ApiEventRecorder, CancellationToken, InformerConfig};
use helmsman_storage::WatchableKV;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Component name stamped on emitted events
pub const COMPONENT: &str = "helmsman-controller-manager";

pub struct ControllerManager {
    config: Arc<ControllerManagerConfig>,
    backend: Arc<dyn WatchableKV>,
    clock: Arc<dyn Clock>,
    cloud: Option<Arc<dyn CloudProvider>>,
}

impl ControllerManager {
    pub fn new(config: ControllerManagerConfig, backend: Arc<dyn WatchableKV>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            clock,
            cloud: None,
        }
    }

    pub fn with_cloud(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.cloud = Some(provider);
        self
    }

    /// Controllers that `run` will start
    pub fn enabled_controllers(&self) -> Vec<&'static str> {
        ALL_CONTROLLERS
            .iter()
            .copied()
            .filter(|name| self.config.is_enabled(name))
            .filter(|name| {
                if *name == CONTROLLER_SERVICE && self.cloud.is_none() {
                    warn!("No cloud provider configured; not starting the {} controller", name);
                    return false;
                }
                true
            })
            .collect()
    }

    /// Run until `token` is cancelled, then give controllers a bounded
    /// amount of time to drain
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        self.config.validate()?;
        let config = self.config.clone();
        let controllers = self.enabled_controllers();
        if controllers.is_empty() {
            warn!("No controllers enabled, exiting");
            return Ok(());
        }

        let client = ApiClient::new(self.backend.clone()).with_timeout(config.api_timeout());
        let (recorder, sink) = ApiEventRecorder::new(client.clone(), COMPONENT, self.clock.clone());
        let informer_config = InformerConfig {
            resync_period: config.resync_period(),
            ..Default::default()
        };
        let informers = Arc::new(SharedInformers::new(&client, informer_config));
        let cloud = self
            .cloud
            .clone()
            .map(|provider| CloudClient::new(provider).with_timeout(config.cloud_timeout()));
        if let Some(cloud) = &cloud {
            info!("Using cloud provider {}", cloud.provider_name());
        }

        let ctx = ControllerContext {
            client,
            recorder: Arc::new(recorder),
            clock: self.clock.clone(),
            informers: informers.clone(),
            cloud,
            config: config.clone(),
        };

        let shutdown = token.child_token();
        let mut background = JoinSet::new();
        informers.spawn_all(&mut background, &shutdown);
        background.spawn(sink.run(shutdown.clone()));

        let mut running: JoinSet<(&'static str, Result<()>)> = JoinSet::new();
        for name in controllers {
            let ctx = ctx.clone();
            let token = shutdown.clone();
            info!("Starting {} controller", name);
            running.spawn(async move {
                let result = match name {
                    CONTROLLER_STATEFULSET => StatefulSetController::new(ctx).run(token).await,
                    CONTROLLER_NODE_LIFECYCLE => NodeLifecycleController::new(ctx).run(token).await,
                    CONTROLLER_TTL_AFTER_FINISHED => TtlAfterFinishedController::new(ctx).run(token).await,
                    CONTROLLER_SERVICE => ServiceController::new(ctx).run(token).await,
                    CONTROLLER_ENDPOINTS => EndpointsController::new(ctx).run(token).await,
                    _ => Ok(()),
                };
                (name, result)
            });
        }
        info!("Controller manager started {} controllers", running.len());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                joined = running.join_next() => match joined {
                    Some(Ok((name, Ok(())))) => info!("{} controller stopped", name),
                    Some(Ok((name, Err(e)))) => error!("{} controller failed: {}", name, e),
                    Some(Err(e)) => error!("Controller task panicked: {}", e),
                    None => {
                        warn!("Every controller has stopped");
                        break;
                    }
                },
            }
        }

        info!("Shutting down controller manager");
        shutdown.cancel();
        let drain = async {
            while running.join_next().await.is_some() {}
            while background.join_next().await.is_some() {}
        };
        if tokio::time::timeout(config.shutdown_timeout(), drain).await.is_err() {
            warn!(
                "Controllers did not stop within {:?}; aborting them",
                config.shutdown_timeout()
            );
            running.abort_all();
            background.abort_all();
        }
        info!("Controller manager stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCloud;
    use helmsman_core::{FakeClock, ObjectKey, Pod, StatefulSet};
    use helmsman_storage::{RedbBackend, ResourceStore};
    use std::time::Duration;

    fn store() -> Arc<ResourceStore> {
        let kv = Arc::new(RedbBackend::in_memory().unwrap());
        Arc::new(ResourceStore::new(kv, Arc::new(FakeClock::new(crate::testutil::start()))).unwrap())
    }

    #[test]
    fn test_service_controller_needs_cloud() {
        let store = store();
        let clock = Arc::new(FakeClock::new(crate::testutil::start()));
        let manager = ControllerManager::new(ControllerManagerConfig::default(), store.clone(), clock.clone());
        assert!(!manager.enabled_controllers().contains(&CONTROLLER_SERVICE));

        let manager = manager.with_cloud(Arc::new(MockCloud::new()));
        assert_eq!(manager.enabled_controllers().len(), ALL_CONTROLLERS.len());

        let config = ControllerManagerConfig {
            controllers: vec![CONTROLLER_ENDPOINTS.to_string()],
            ..Default::default()
        };
        let manager = ControllerManager::new(config, store, clock);
        assert_eq!(manager.enabled_controllers(), vec![CONTROLLER_ENDPOINTS]);
    }

    #[tokio::test]
    async fn test_runs_controllers_until_cancelled() {
        let store = store();
        let clock = Arc::new(FakeClock::new(crate::testutil::start()));
        let client = ApiClient::new(store.clone());
        let set: StatefulSet = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "replicas": 1,
                "serviceName": "web",
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"containers": [{"name": "app", "image": "nginx:1.27"}]}
                }
            }
        }))
        .unwrap();
        client.create(&set).await.unwrap();

        let manager = ControllerManager::new(ControllerManagerConfig::default(), store, clock);
        let token = CancellationToken::new();
        let handle = tokio::spawn(manager.run(token.clone()));

        let key = ObjectKey::new("default", "web-0");
        let created = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if client.get_opt::<Pod>(&key).await.unwrap().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(created.is_ok(), "web-0 was never created");

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
