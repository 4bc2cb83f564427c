//! Node condition and version helpers

use k8s_openapi::api::core::v1::{Node, NodeCondition};
use std::cmp::Ordering;
use std::fmt;

pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_ZONE_LEGACY: &str = "failure-domain.beta.kubernetes.io/zone";
pub const LABEL_REGION: &str = "topology.kubernetes.io/region";

/// Status of the `Ready` condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyStatus {
    True,
    False,
    Unknown,
}

impl ReadyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyStatus::True => "True",
            ReadyStatus::False => "False",
            ReadyStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ReadyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn condition<'a>(node: &'a Node, type_: &str) -> Option<&'a NodeCondition> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
}

/// A node without a Ready condition has never reported and counts as Unknown
pub fn ready_status(node: &Node) -> ReadyStatus {
    match condition(node, "Ready").map(|c| c.status.as_str()) {
        Some("True") => ReadyStatus::True,
        Some("False") => ReadyStatus::False,
        _ => ReadyStatus::Unknown,
    }
}

pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Zone key used to group nodes for disruption accounting
pub fn zone(node: &Node) -> String {
    let labels = node.metadata.labels.as_ref();
    let get = |k: &str| labels.and_then(|l| l.get(k)).cloned();
    let zone = get(LABEL_ZONE).or_else(|| get(LABEL_ZONE_LEGACY));
    let region = get(LABEL_REGION);
    match (region, zone) {
        (Some(r), Some(z)) => format!("{}:{}", r, z),
        (None, Some(z)) => z,
        (Some(r), None) => r,
        (None, None) => String::new(),
    }
}

pub fn kubelet_version(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .node_info
        .as_ref()
        .map(|i| i.kubelet_version.as_str())
        .filter(|v| !v.is_empty())
}

pub fn provider_id(node: &Node) -> Option<&str> {
    node.spec.as_ref()?.provider_id.as_deref()
}

/// Semantic version of a node agent, as reported in `kubeletVersion`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl AgentVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses `v1.2.3`, `1.2.3`, and versions carrying pre-release or build suffixes
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('v');
        let core = s.split(['-', '+']).next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

impl PartialOrd for AgentVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AgentVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for AgentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeStatus;
    use std::collections::BTreeMap;

    #[test]
    fn test_ready_status() {
        let mut node = Node::default();
        assert_eq!(ready_status(&node), ReadyStatus::Unknown);

        node.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "False".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(ready_status(&node), ReadyStatus::False);
    }

    #[test]
    fn test_zone_falls_back_to_legacy_label() {
        let mut node = Node::default();
        assert_eq!(zone(&node), "");

        node.metadata.labels = Some(BTreeMap::from([(
            LABEL_ZONE_LEGACY.to_string(),
            "us-east-1a".to_string(),
        )]));
        assert_eq!(zone(&node), "us-east-1a");
    }

    #[test]
    fn test_agent_version_parse() {
        assert_eq!(AgentVersion::parse("v1.31.2"), Some(AgentVersion::new(1, 31, 2)));
        assert_eq!(AgentVersion::parse("1.2"), Some(AgentVersion::new(1, 2, 0)));
        assert_eq!(
            AgentVersion::parse("v1.1.0-beta.1+abc"),
            Some(AgentVersion::new(1, 1, 0))
        );
        assert_eq!(AgentVersion::parse("garbage"), None);
        assert!(AgentVersion::new(1, 0, 9) < AgentVersion::new(1, 1, 0));
    }
}
