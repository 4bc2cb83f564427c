//! Taint and toleration matching

use crate::annotations;
use crate::resources::Resource;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Taint, Toleration};
use tracing::warn;

pub const TAINT_NODE_UNREACHABLE: &str = "node.kubernetes.io/unreachable";
pub const TAINT_NODE_NOT_READY: &str = "node.kubernetes.io/not-ready";

pub const EFFECT_NO_SCHEDULE: &str = "NoSchedule";
pub const EFFECT_PREFER_NO_SCHEDULE: &str = "PreferNoSchedule";
pub const EFFECT_NO_EXECUTE: &str = "NoExecute";

/// Whether a single toleration tolerates a taint.
///
/// An empty key with operator `Exists` tolerates every taint; an empty
/// effect matches all effects. A missing operator means `Equal`.
pub fn toleration_tolerates(tol: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = tol.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }

    let key = tol.key.as_deref().unwrap_or_default();
    let exists = tol.operator.as_deref() == Some("Exists");

    if key.is_empty() {
        return exists;
    }
    if key != taint.key {
        return false;
    }
    if exists {
        return true;
    }
    tol.value.as_deref().unwrap_or_default() == taint.value.as_deref().unwrap_or_default()
}

/// Whether any of the tolerations tolerates the taint
pub fn tolerates(tolerations: &[Toleration], taint: &Taint) -> bool {
    tolerations.iter().any(|t| toleration_tolerates(t, taint))
}

/// Outcome of checking a pod's tolerations against a node's NoExecute taints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionVerdict {
    /// Tolerated indefinitely, or no NoExecute taints apply
    Keep,
    /// Some NoExecute taint is not tolerated
    Evict,
    /// Tolerated only until the given instant
    EvictAt(DateTime<Utc>),
}

/// Evaluates every NoExecute taint; `PreferNoSchedule` and `NoSchedule`
/// taints never cause eviction. For taints tolerated with
/// `tolerationSeconds`, the deadline counts from the taint's `timeAdded`
/// (or `fallback_added` when the taint carries none) and the earliest
/// deadline wins.
pub fn eviction_verdict(
    tolerations: &[Toleration],
    taints: &[Taint],
    fallback_added: DateTime<Utc>,
) -> EvictionVerdict {
    let mut deadline: Option<DateTime<Utc>> = None;

    for taint in taints.iter().filter(|t| t.effect == EFFECT_NO_EXECUTE) {
        let matching: Vec<&Toleration> = tolerations
            .iter()
            .filter(|t| toleration_tolerates(t, taint))
            .collect();
        if matching.is_empty() {
            return EvictionVerdict::Evict;
        }
        // Any toleration without a bound keeps the pod forever for this taint
        if matching.iter().any(|t| t.toleration_seconds.is_none()) {
            continue;
        }
        let secs = matching
            .iter()
            .filter_map(|t| t.toleration_seconds)
            .min()
            .unwrap_or(0)
            .max(0);
        let added = taint.time_added.as_ref().map(|t| t.0).unwrap_or(fallback_added);
        let at = added + chrono::Duration::seconds(secs);
        deadline = Some(deadline.map_or(at, |d| d.min(at)));
    }

    match deadline {
        Some(at) => EvictionVerdict::EvictAt(at),
        None => EvictionVerdict::Keep,
    }
}

/// Node taints. `spec.taints` wins; the legacy annotation is a read-only fallback.
pub fn node_taints(node: &Node) -> Vec<Taint> {
    if let Some(taints) = node.spec.as_ref().and_then(|s| s.taints.clone()) {
        return taints;
    }
    match node.annotation(annotations::NODE_TAINTS) {
        Some(raw) => match serde_json::from_str::<Vec<Taint>>(raw) {
            Ok(taints) => taints,
            Err(e) => {
                warn!(
                    "Ignoring malformed {} annotation on node {}: {}",
                    annotations::NODE_TAINTS,
                    node.name(),
                    e
                );
                Vec::new()
            }
        },
        None => Vec::new(),
    }
}

pub fn has_taint(taints: &[Taint], key: &str, effect: &str) -> bool {
    taints.iter().any(|t| t.key == key && t.effect == effect)
}
