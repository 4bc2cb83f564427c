//! Persisted legacy annotations.
//!
//! A spec field, when present, always wins. These keys are read as a
//! fallback on objects lacking the field and are never written.

use crate::error::Result;
use crate::net::Cidr;
use crate::resources::Resource;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub const LB_SOURCE_RANGES: &str = "service.beta.kubernetes.io/load-balancer-source-ranges";
pub const EXTERNAL_TRAFFIC: &str = "service.beta.kubernetes.io/external-traffic";
pub const HEALTHCHECK_NODEPORT: &str = "service.beta.kubernetes.io/healthcheck-nodeport";
pub const NODE_TAINTS: &str = "node.alpha.kubernetes.io/taints";
pub const DEPLOYMENT_REVISION: &str = "deployment.kubernetes.io/revision";
pub const TOLERATE_UNREADY_ENDPOINTS: &str =
    "service.alpha.kubernetes.io/tolerate-unready-endpoints";

pub const EXTERNAL_TRAFFIC_ONLY_LOCAL: &str = "OnlyLocal";
pub const EXTERNAL_TRAFFIC_GLOBAL: &str = "Global";

/// Allowed client CIDRs for a load balancer.
///
/// `spec.loadBalancerSourceRanges` wins, then the comma-separated
/// annotation, then `0.0.0.0/0`. Any malformed entry is an error.
pub fn load_balancer_source_ranges(service: &Service) -> Result<Vec<Cidr>> {
    let from_spec = service
        .spec
        .as_ref()
        .and_then(|s| s.load_balancer_source_ranges.as_ref())
        .filter(|r| !r.is_empty());

    let raw: Vec<String> = match from_spec {
        Some(ranges) => ranges.clone(),
        None => match service.annotation(LB_SOURCE_RANGES) {
            Some(val) if !val.trim().is_empty() => val.split(',').map(String::from).collect(),
            _ => return Ok(vec![Cidr::any_v4()]),
        },
    };

    raw.iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .map(|r| r.parse::<Cidr>())
        .collect()
}

/// Whether external traffic must stay on the receiving node
pub fn external_traffic_local(service: &Service) -> bool {
    if let Some(policy) = service
        .spec
        .as_ref()
        .and_then(|s| s.external_traffic_policy.as_deref())
    {
        return policy == "Local";
    }
    service.annotation(EXTERNAL_TRAFFIC) == Some(EXTERNAL_TRAFFIC_ONLY_LOCAL)
}

pub fn health_check_node_port(service: &Service) -> Option<i32> {
    if let Some(port) = service.spec.as_ref().and_then(|s| s.health_check_node_port) {
        return Some(port);
    }
    service
        .annotation(HEALTHCHECK_NODEPORT)
        .and_then(|v| v.trim().parse().ok())
}

/// `true` when the legacy annotation asks for unready endpoints to be published
pub fn tolerates_unready_endpoints(service: &Service) -> bool {
    service
        .annotation(TOLERATE_UNREADY_ENDPOINTS)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn deployment_revision(meta: &ObjectMeta) -> Option<i64> {
    meta.annotations
        .as_ref()?
        .get(DEPLOYMENT_REVISION)?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use std::collections::BTreeMap;

    fn service_with(annotations: &[(&str, &str)], spec: ServiceSpec) -> Service {
        let mut svc = Service::default();
        svc.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        svc.spec = Some(spec);
        svc
    }

    #[test]
    fn test_source_ranges_precedence() {
        let svc = service_with(&[], ServiceSpec::default());
        assert_eq!(load_balancer_source_ranges(&svc).unwrap(), vec![Cidr::any_v4()]);

        let svc = service_with(
            &[(LB_SOURCE_RANGES, "10.0.0.0/8, 192.168.0.0/16")],
            ServiceSpec::default(),
        );
        assert_eq!(load_balancer_source_ranges(&svc).unwrap().len(), 2);

        let svc = service_with(
            &[(LB_SOURCE_RANGES, "10.0.0.0/8")],
            ServiceSpec {
                load_balancer_source_ranges: Some(vec!["203.0.113.0/24".to_string()]),
                ..Default::default()
            },
        );
        let ranges = load_balancer_source_ranges(&svc).unwrap();
        assert_eq!(ranges[0].to_string(), "203.0.113.0/24");

        let svc = service_with(&[(LB_SOURCE_RANGES, "10.0.0.0/8,bogus")], ServiceSpec::default());
        assert!(load_balancer_source_ranges(&svc).is_err());
    }

    #[test]
    fn test_external_traffic_and_health_check() {
        let svc = service_with(
            &[(EXTERNAL_TRAFFIC, "OnlyLocal"), (HEALTHCHECK_NODEPORT, "30100")],
            ServiceSpec::default(),
        );
        assert!(external_traffic_local(&svc));
        assert_eq!(health_check_node_port(&svc), Some(30100));

        let svc = service_with(
            &[(EXTERNAL_TRAFFIC, "OnlyLocal"), (HEALTHCHECK_NODEPORT, "30100")],
            ServiceSpec {
                external_traffic_policy: Some("Cluster".to_string()),
                health_check_node_port: Some(31000),
                ..Default::default()
            },
        );
        assert!(!external_traffic_local(&svc));
        assert_eq!(health_check_node_port(&svc), Some(31000));
    }

    #[test]
    fn test_deployment_revision() {
        let mut meta = ObjectMeta::default();
        assert_eq!(deployment_revision(&meta), None);
        meta.annotations = Some(BTreeMap::from([(
            DEPLOYMENT_REVISION.to_string(),
            "7".to_string(),
        )]));
        assert_eq!(deployment_revision(&meta), Some(7));
    }
}
