//! Helmsman Core - Fundamental types and traits for the Helmsman controllers
//!
//! This crate provides:
//! - Resource abstractions over the upstream Kubernetes schema
//! - The shared error taxonomy with miette diagnostics
//! - Object keys, revisions, label and field selectors
//! - Taint/toleration matching and the legacy annotations
//! - Serialization helpers

pub mod annotations;
pub mod clock;
pub mod error;
pub mod events;
pub mod net;
pub mod resources;
pub mod selector;
pub mod taints;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{HelmsmanError, Result};
pub use events::{EventType, ResourceEvent, WatchEventType};
pub use net::Cidr;
pub use resources::{is_valid_name, Resource, ResourceError};
pub use selector::{FieldSelector, LabelSelector};
pub use types::{GroupVersionKind, ObjectKey, ResourceKey, ResourceVersion};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::apps::v1::StatefulSet;
pub use k8s_openapi::api::batch::v1::Job;
pub use k8s_openapi::api::core::v1::{Endpoints, Event, Namespace, Node, Pod, Service};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Serialize a resource to a JSON value
pub fn to_value<T: serde::Serialize>(resource: &T) -> Result<serde_json::Value> {
    serde_json::to_value(resource).map_err(|e| {
        HelmsmanError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a resource from a JSON value
pub fn from_value<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        HelmsmanError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Serialize a value to YAML
pub fn to_yaml<T: serde::Serialize>(resource: &T) -> Result<String> {
    serde_yaml::to_string(resource).map_err(|e| {
        HelmsmanError::serialization_error(
            format!("Failed to serialize to YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a value from YAML
pub fn from_yaml<T: serde::de::DeserializeOwned>(data: &str) -> Result<T> {
    serde_yaml::from_str(data).map_err(|e| {
        HelmsmanError::serialization_error(
            format!("Failed to deserialize from YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}
