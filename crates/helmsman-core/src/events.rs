use crate::types::{GroupVersionKind, ResourceKey, ResourceVersion};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A change emitted by the storage backend on every committed mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Type of watch event (ADDED, MODIFIED, DELETED)
    pub event_type: WatchEventType,
    /// GroupVersionKind of the resource
    pub gvk: GroupVersionKind,
    /// Full resource key (gvk + namespace + name)
    pub resource_key: ResourceKey,
    /// The serialized resource object
    pub object: serde_json::Value,
    /// Revision that produced this event
    pub resource_version: ResourceVersion,
}

impl ResourceEvent {
    pub fn added(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: ResourceVersion,
    ) -> Self {
        Self::new(WatchEventType::Added, resource_key, object, resource_version)
    }

    pub fn modified(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: ResourceVersion,
    ) -> Self {
        Self::new(WatchEventType::Modified, resource_key, object, resource_version)
    }

    pub fn deleted(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: ResourceVersion,
    ) -> Self {
        Self::new(WatchEventType::Deleted, resource_key, object, resource_version)
    }

    fn new(
        event_type: WatchEventType,
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: ResourceVersion,
    ) -> Self {
        Self {
            event_type,
            gvk: resource_key.gvk.clone(),
            resource_key,
            object,
            resource_version,
        }
    }
}

/// Severity of a user-visible event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
