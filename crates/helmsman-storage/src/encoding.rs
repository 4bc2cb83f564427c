use helmsman_core::{GroupVersionKind, ResourceKey};

/// Key encoder for storage keys
pub struct KeyEncoder;

/// Reserved prefix for backend bookkeeping, never a valid group name
pub const META_PREFIX: &str = "__meta/";
pub const REVISION_KEY: &str = "__meta/revision";

impl KeyEncoder {
    /// Encode a resource key: {group}/{version}/{kind}/{namespace}/{name}
    pub fn encode_resource_key(key: &ResourceKey) -> String {
        key.storage_key()
    }

    /// Prefix covering a kind, optionally narrowed to one namespace
    pub fn encode_prefix(gvk: &GroupVersionKind, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!("{}{}/", gvk.storage_prefix(), ns),
            None => gvk.storage_prefix(),
        }
    }

    /// Parse a storage key back into a ResourceKey
    pub fn parse_key(key: &str) -> Option<ResourceKey> {
        let parts: Vec<&str> = key.split('/').collect();
        let [group, version, kind, namespace, name] = parts.as_slice() else {
            return None;
        };
        if name.is_empty() {
            return None;
        }
        let group = if *group == "core" { "" } else { *group };
        Some(ResourceKey::new(
            GroupVersionKind::new(group, *version, *kind),
            *namespace,
            *name,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefix() {
        let pods = GroupVersionKind::from_api_version_kind("v1", "Pod");
        assert_eq!(
            KeyEncoder::encode_prefix(&pods, Some("default")),
            "core/v1/Pod/default/"
        );
        assert_eq!(KeyEncoder::encode_prefix(&pods, None), "core/v1/Pod/");
    }

    #[test]
    fn test_parse_key() {
        let key = KeyEncoder::parse_key("apps/v1/StatefulSet/db/web").unwrap();
        assert_eq!(key.gvk.api_version(), "apps/v1");
        assert_eq!(key.gvk.kind, "StatefulSet");
        assert_eq!(key.namespace, "db");
        assert_eq!(key.name, "web");

        let key = KeyEncoder::parse_key("core/v1/Node//node-1").unwrap();
        assert_eq!(key.gvk.api_version(), "v1");
        assert!(!key.is_namespaced());
        assert_eq!(KeyEncoder::encode_resource_key(&key), "core/v1/Node//node-1");

        assert!(KeyEncoder::parse_key(REVISION_KEY).is_none());
        assert!(KeyEncoder::parse_key("core/v1/Pod/default/").is_none());
    }
}
