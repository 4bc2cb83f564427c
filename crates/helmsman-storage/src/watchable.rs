use async_trait::async_trait;
use futures_util::stream::BoxStream;
use helmsman_core::{
    FieldSelector, GroupVersionKind, LabelSelector, ObjectKey, ResourceEvent, ResourceVersion,
    Result,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Filters applied to list and watch
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<FieldSelector>,
}

impl ListOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, selector: LabelSelector) -> Self {
        self.label_selector = Some(selector);
        self
    }

    pub fn with_fields(mut self, selector: FieldSelector) -> Self {
        self.field_selector = Some(selector);
        self
    }

    /// Whether a stored object passes every filter
    pub fn matches(&self, object: &Value) -> bool {
        if let Some(ns) = &self.namespace {
            let obj_ns = object["metadata"]["namespace"].as_str().unwrap_or_default();
            if obj_ns != ns {
                return false;
            }
        }
        if let Some(selector) = &self.label_selector {
            if !selector.matches(labels_of(object).as_ref()) {
                return false;
            }
        }
        if let Some(selector) = &self.field_selector {
            if !selector.matches(object) {
                return false;
            }
        }
        true
    }
}

fn labels_of(object: &Value) -> Option<BTreeMap<String, String>> {
    let labels = object.get("metadata")?.get("labels")?;
    serde_json::from_value(labels.clone()).ok()
}

/// A consistent snapshot of one kind
#[derive(Debug, Clone)]
pub struct ListResult {
    pub items: Vec<Value>,
    /// Revision the snapshot was taken at; watch from here to miss nothing
    pub resource_version: ResourceVersion,
}

/// What happens to dependents when their owner is deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PropagationPolicy {
    /// Dependents keep running with the owner reference removed
    Orphan,
    /// The owner goes first, dependents are deleted afterwards
    #[default]
    Background,
    /// The owner stays, terminating, until every dependent is gone
    Foreground,
}

/// Conditions the stored object must satisfy for a delete to proceed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<ResourceVersion>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Overrides the object's own grace period; `Some(0)` forces removal
    pub grace_period_seconds: Option<i64>,
    pub preconditions: Preconditions,
    pub propagation_policy: PropagationPolicy,
}

impl DeleteOptions {
    pub fn force() -> Self {
        Self {
            grace_period_seconds: Some(0),
            ..Default::default()
        }
    }

    pub fn with_grace(seconds: i64) -> Self {
        Self {
            grace_period_seconds: Some(seconds),
            ..Default::default()
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.preconditions.uid = Some(uid.into());
        self
    }

    pub fn with_propagation(mut self, policy: PropagationPolicy) -> Self {
        self.propagation_policy = policy;
        self
    }
}

/// Result of a delete call
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// The object is gone; this is its final state
    Deleted(Value),
    /// The object is terminating and still stored (grace period or finalizers)
    Terminating(Value),
}

impl DeleteOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted(_))
    }

    pub fn into_object(self) -> Value {
        match self {
            DeleteOutcome::Deleted(v) | DeleteOutcome::Terminating(v) => v,
        }
    }
}

pub type WatchStream = BoxStream<'static, Result<ResourceEvent>>;

/// A revisioned object store with change streams
#[async_trait]
pub trait WatchableKV: Send + Sync {
    async fn list(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> Result<ListResult>;

    /// Events for `gvk` newer than `since`. Fails with `Expired` when
    /// `since` predates the retained history.
    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        since: ResourceVersion,
        opts: &ListOptions,
    ) -> Result<WatchStream>;

    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<Value>;

    async fn create(&self, gvk: &GroupVersionKind, object: Value) -> Result<Value>;

    async fn update(&self, gvk: &GroupVersionKind, object: Value) -> Result<Value>;

    async fn update_status(&self, gvk: &GroupVersionKind, object: Value) -> Result<Value>;

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
        opts: &DeleteOptions,
    ) -> Result<DeleteOutcome>;
}
