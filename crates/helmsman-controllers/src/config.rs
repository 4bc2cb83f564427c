//! Controller manager configuration.
//!
//! Every field has a default, so an empty YAML document (or no file at
//! all) yields a working configuration. CLI flags are applied on top.

use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONTROLLER_STATEFULSET: &str = "statefulset";
pub const CONTROLLER_NODE_LIFECYCLE: &str = "nodelifecycle";
pub const CONTROLLER_TTL_AFTER_FINISHED: &str = "ttl-after-finished";
pub const CONTROLLER_SERVICE: &str = "service";
pub const CONTROLLER_ENDPOINTS: &str = "endpoints";

pub const ALL_CONTROLLERS: &[&str] = &[
    CONTROLLER_STATEFULSET,
    CONTROLLER_NODE_LIFECYCLE,
    CONTROLLER_TTL_AFTER_FINISHED,
    CONTROLLER_SERVICE,
    CONTROLLER_ENDPOINTS,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerManagerConfig {
    pub cluster_name: String,
    /// Controllers to run; `*` enables all of them, `-name` disables one
    pub controllers: Vec<String>,
    pub cache_sync_timeout_secs: u64,
    pub api_timeout_secs: u64,
    pub cloud_timeout_secs: u64,
    pub reconcile_timeout_secs: u64,
    pub max_conflict_retries: u32,
    /// Informer resync; 0 disables it
    pub resync_period_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub statefulset: StatefulSetControllerConfig,
    pub node_lifecycle: NodeLifecycleControllerConfig,
    pub ttl_after_finished: TtlAfterFinishedControllerConfig,
    pub service: ServiceControllerConfig,
    pub endpoints: EndpointsControllerConfig,
}

impl Default for ControllerManagerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "helmsman".to_string(),
            controllers: vec!["*".to_string()],
            cache_sync_timeout_secs: 60,
            api_timeout_secs: 30,
            cloud_timeout_secs: 60,
            reconcile_timeout_secs: 300,
            max_conflict_retries: 3,
            resync_period_secs: 0,
            shutdown_timeout_secs: 5,
            statefulset: StatefulSetControllerConfig::default(),
            node_lifecycle: NodeLifecycleControllerConfig::default(),
            ttl_after_finished: TtlAfterFinishedControllerConfig::default(),
            service: ServiceControllerConfig::default(),
            endpoints: EndpointsControllerConfig::default(),
        }
    }
}

impl ControllerManagerConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw).map_err(|e| {
            ControllerError::invalid_config(
                format!("Failed to parse configuration: {}", e),
                "Check the YAML syntax and field names (camelCase)",
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::invalid_config(
                format!("Failed to read {}: {}", path.display(), e),
                "Pass an existing, readable file to --config",
            )
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        for name in &self.controllers {
            let bare = name.trim_start_matches('-');
            if bare != "*" && !ALL_CONTROLLERS.contains(&bare) {
                return Err(ControllerError::invalid_config(
                    format!("Unknown controller '{}'", name),
                    format!("Known controllers: {}", ALL_CONTROLLERS.join(", ")),
                ));
            }
        }
        let nl = &self.node_lifecycle;
        if !(0.0..=1.0).contains(&nl.unhealthy_zone_threshold) {
            return Err(ControllerError::invalid_config(
                format!("unhealthyZoneThreshold {} is not a fraction", nl.unhealthy_zone_threshold),
                "Use a value between 0.0 and 1.0",
            ));
        }
        if nl.node_eviction_rate < 0.0 || nl.secondary_node_eviction_rate < 0.0 {
            return Err(ControllerError::invalid_config(
                "Eviction rates must not be negative",
                "Use 0 to pause eviction",
            ));
        }
        let svc = &self.service;
        if svc.min_retry_delay_secs > svc.max_retry_delay_secs {
            return Err(ControllerError::invalid_config(
                "minRetryDelaySecs is larger than maxRetryDelaySecs",
                "Swap the two values",
            ));
        }
        Ok(())
    }

    /// Whether a controller is enabled by the `controllers` list
    pub fn is_enabled(&self, name: &str) -> bool {
        let disabled = format!("-{}", name);
        if self.controllers.iter().any(|c| *c == disabled) {
            return false;
        }
        self.controllers.iter().any(|c| c == "*" || c == name)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud_timeout_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatefulSetControllerConfig {
    pub concurrent_syncs: usize,
}

impl Default for StatefulSetControllerConfig {
    fn default() -> Self {
        Self { concurrent_syncs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeLifecycleControllerConfig {
    pub concurrent_syncs: usize,
    /// How often node health is evaluated
    pub node_monitor_period_secs: u64,
    /// A heartbeat older than this makes the node `Unknown`
    pub node_monitor_grace_period_secs: u64,
    /// Eviction qps per zone in normal conditions
    pub node_eviction_rate: f64,
    /// Eviction qps per zone when a large zone is partially disrupted
    pub secondary_node_eviction_rate: f64,
    /// Zones at least this large keep evicting (slowly) when partially disrupted
    pub large_cluster_size_threshold: usize,
    /// Fraction of unhealthy nodes above which a zone is partially disrupted
    pub unhealthy_zone_threshold: f64,
    /// Consecutive healthy observations before NoExecute taints are removed
    pub healthy_observations_to_untaint: u32,
    /// Upper bound on the grace period given to evicted pods
    pub max_pod_grace_period_secs: i64,
    /// Nodes whose agent is older than this do not support graceful deletion
    pub pod_status_reconciliation_min_version: String,
}

impl Default for NodeLifecycleControllerConfig {
    fn default() -> Self {
        Self {
            concurrent_syncs: 1,
            node_monitor_period_secs: 5,
            node_monitor_grace_period_secs: 40,
            node_eviction_rate: 0.1,
            secondary_node_eviction_rate: 0.01,
            large_cluster_size_threshold: 20,
            unhealthy_zone_threshold: 0.55,
            healthy_observations_to_untaint: 1,
            max_pod_grace_period_secs: 300,
            pod_status_reconciliation_min_version: "1.2.0".to_string(),
        }
    }
}

impl NodeLifecycleControllerConfig {
    pub fn node_monitor_period(&self) -> Duration {
        Duration::from_secs(self.node_monitor_period_secs.max(1))
    }

    pub fn node_monitor_grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.node_monitor_grace_period_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TtlAfterFinishedControllerConfig {
    pub concurrent_syncs: usize,
}

impl Default for TtlAfterFinishedControllerConfig {
    fn default() -> Self {
        Self { concurrent_syncs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceControllerConfig {
    pub concurrent_syncs: usize,
    pub node_sync_period_secs: u64,
    pub min_retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
}

impl Default for ServiceControllerConfig {
    fn default() -> Self {
        Self {
            concurrent_syncs: 1,
            node_sync_period_secs: 100,
            min_retry_delay_secs: 5,
            max_retry_delay_secs: 300,
        }
    }
}

impl ServiceControllerConfig {
    pub fn node_sync_period(&self) -> Duration {
        Duration::from_secs(self.node_sync_period_secs.max(1))
    }

    pub fn min_retry_delay(&self) -> Duration {
        Duration::from_secs(self.min_retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndpointsControllerConfig {
    pub concurrent_syncs: usize,
}

impl Default for EndpointsControllerConfig {
    fn default() -> Self {
        Self { concurrent_syncs: 5 }
    }
}
