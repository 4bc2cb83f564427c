pub mod node;
pub mod pod;

use crate::{GroupVersionKind, ObjectKey, ResourceKey, ResourceVersion};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Endpoints, Event, Namespace, Node, ObjectReference, Pod, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Base validation for all resources
pub fn validate_base(metadata: &ObjectMeta) -> Result<(), ResourceError> {
    match &metadata.name {
        None => Err(ResourceError::MissingField("metadata.name".to_string())),
        Some(name) if !is_valid_name(name) => Err(ResourceError::InvalidName(name.clone())),
        Some(_) => Ok(()),
    }
}

/// Trait for the resource kinds the controllers manage
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const API_VERSION: &'static str;
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn gvk() -> GroupVersionKind {
        GroupVersionKind::from_api_version_kind(Self::API_VERSION, Self::KIND)
    }

    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }

    fn resource_key(&self) -> Result<ResourceKey, ResourceError> {
        let name = self
            .metadata()
            .name
            .as_ref()
            .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;
        Ok(ResourceKey::new(Self::gvk(), self.namespace(), name))
    }

    /// Parsed `metadata.resourceVersion`, if it is set and numeric
    fn resource_version(&self) -> Option<ResourceVersion> {
        self.metadata()
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse().ok())
    }

    fn uid(&self) -> Option<&str> {
        self.metadata().uid.as_deref()
    }

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata().labels.as_ref()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// A non-nil deletionTimestamp marks the object as terminating
    fn is_terminating(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    /// The owner reference flagged as the managing controller
    fn controller_ref(&self) -> Option<&OwnerReference> {
        self.metadata()
            .owner_references
            .as_ref()?
            .iter()
            .find(|r| r.controller == Some(true))
    }

    fn object_reference(&self) -> ObjectReference {
        let meta = self.metadata();
        ObjectReference {
            api_version: Some(Self::API_VERSION.to_string()),
            kind: Some(Self::KIND.to_string()),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(self.metadata())
    }
}

/// Resource-related errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl From<ResourceError> for crate::HelmsmanError {
    fn from(err: ResourceError) -> Self {
        crate::HelmsmanError::invalid(err.to_string(), "Fix the object and resubmit it")
    }
}

/// Validate a resource name (DNS-1123 subdomain)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    bytes.iter().all(|&b| alnum(b) || b == b'-' || b == b'.')
}

macro_rules! impl_resource {
    ($ty:ty, $api_version:literal, $kind:literal) => {
        impl Resource for $ty {
            const API_VERSION: &'static str = $api_version;
            const KIND: &'static str = $kind;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

impl_resource!(Node, "v1", "Node");
impl_resource!(Service, "v1", "Service");
impl_resource!(Endpoints, "v1", "Endpoints");
impl_resource!(Namespace, "v1", "Namespace");
impl_resource!(Event, "v1", "Event");
impl_resource!(StatefulSet, "apps/v1", "StatefulSet");
impl_resource!(Job, "batch/v1", "Job");

impl Resource for Pod {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Pod";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(&self.metadata)?;

        match &self.spec {
            Some(spec) if spec.containers.is_empty() => Err(ResourceError::ValidationFailed(
                "Pod must have at least one container".to_string(),
            )),
            Some(_) => Ok(()),
            None => Err(ResourceError::MissingField("spec".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_name() {
        assert!(is_valid_name("nginx"));
        assert!(is_valid_name("web-0"));
        assert!(is_valid_name("my.app"));

        assert!(!is_valid_name(""));
        assert!(!is_valid_name("MyApp"));
        assert!(!is_valid_name("-web"));
        assert!(!is_valid_name("web-"));
        assert!(!is_valid_name("my_app"));
    }

    #[test]
    fn test_pod_keys() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("web-0".to_string());
        pod.metadata.namespace = Some("default".to_string());

        let key = pod.resource_key().unwrap();
        assert_eq!(key.name, "web-0");
        assert_eq!(key.namespace, "default");
        assert_eq!(key.gvk.kind, "Pod");
        assert_eq!(pod.object_key().to_string(), "default/web-0");
        assert_eq!(StatefulSet::gvk().api_version(), "apps/v1");
    }

    #[test]
    fn test_controller_ref() {
        let mut pod = Pod::default();
        pod.metadata.owner_references = Some(vec![
            OwnerReference {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                name: "cfg".to_string(),
                uid: "u1".to_string(),
                ..Default::default()
            },
            OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "StatefulSet".to_string(),
                name: "web".to_string(),
                uid: "u2".to_string(),
                controller: Some(true),
                ..Default::default()
            },
        ]);

        let owner = pod.controller_ref().unwrap();
        assert_eq!(owner.kind, "StatefulSet");
        assert_eq!(owner.uid, "u2");
    }

    #[test]
    fn test_pod_validation() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("nginx".to_string());
        assert!(matches!(pod.validate(), Err(ResourceError::MissingField(_))));

        pod.spec = Some(Default::default());
        assert!(matches!(
            pod.validate(),
            Err(ResourceError::ValidationFailed(_))
        ));
    }
}
