//! Thread-safe local cache filled by an informer.
//!
//! Objects are stored behind `Arc` and shared with every reader. Readers
//! never mutate them in place; a controller that wants to write clones
//! the object first.

use helmsman_core::resources::pod;
use helmsman_core::{ObjectKey, Pod, Resource};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const INDEX_NAMESPACE: &str = "namespace";
pub const INDEX_NODE_NAME: &str = "nodeName";
pub const INDEX_CONTROLLER_UID: &str = "controllerUid";

/// Maps an object to the index values it should be found under
pub type IndexFn<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;

struct StoreInner<T> {
    items: HashMap<ObjectKey, Arc<T>>,
    indexers: HashMap<String, IndexFn<T>>,
    // index name -> index value -> keys
    indices: HashMap<String, HashMap<String, HashSet<ObjectKey>>>,
}

impl<T> StoreInner<T> {
    fn index(&mut self, key: &ObjectKey, obj: &T) {
        for (name, f) in &self.indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for value in f(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }

    fn unindex(&mut self, key: &ObjectKey, obj: &T) {
        for (name, f) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for value in f(obj) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }
}

pub struct Store<T> {
    inner: RwLock<StoreInner<T>>,
}

impl<T: Resource> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> Store<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                items: HashMap::new(),
                indexers: HashMap::new(),
                indices: HashMap::new(),
            }),
        }
    }

    /// Register an index; existing items are indexed immediately
    pub fn add_indexer(&self, name: impl Into<String>, f: IndexFn<T>) {
        let name = name.into();
        let mut inner = self.inner.write();
        let mut index: HashMap<String, HashSet<ObjectKey>> = HashMap::new();
        for (key, obj) in &inner.items {
            for value in f(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
        inner.indices.insert(name.clone(), index);
        inner.indexers.insert(name, f);
    }

    pub fn with_indexer(self, name: impl Into<String>, f: IndexFn<T>) -> Self {
        self.add_indexer(name, f);
        self
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<T>> {
        self.inner.read().items.get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.inner.read().items.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.inner.read().items.keys().cloned().collect()
    }

    /// Objects filed under `value` in the named index
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<T>> {
        let inner = self.inner.read();
        let Some(keys) = inner.indices.get(index).and_then(|i| i.get(value)) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|k| inner.items.get(k).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace; returns the previous object
    pub fn upsert(&self, obj: Arc<T>) -> Option<Arc<T>> {
        let key = obj.object_key();
        let mut inner = self.inner.write();
        let old = inner.items.insert(key.clone(), obj.clone());
        if let Some(old) = &old {
            inner.unindex(&key, old);
        }
        inner.index(&key, &obj);
        old
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<T>> {
        let mut inner = self.inner.write();
        let old = inner.items.remove(key)?;
        inner.unindex(key, &old);
        Some(old)
    }
}

pub fn index_by_namespace<T: Resource>() -> IndexFn<T> {
    Arc::new(|obj: &T| vec![obj.namespace().to_string()])
}

/// Pods by `spec.nodeName`; unbound pods are not indexed
pub fn index_pods_by_node() -> IndexFn<Pod> {
    Arc::new(|p: &Pod| {
        let node = pod::node_name(p);
        if node.is_empty() {
            Vec::new()
        } else {
            vec![node.to_string()]
        }
    })
}

/// Objects by the uid of their controlling owner
pub fn index_by_controller_uid<T: Resource>() -> IndexFn<T> {
    Arc::new(|obj: &T| {
        obj.controller_ref()
            .map(|r| vec![r.uid.clone()])
            .unwrap_or_default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn make_pod(ns: &str, name: &str, node: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: (!node.is_empty()).then(|| node.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_get_remove() {
        let store = Store::<Pod>::new();
        assert!(store.upsert(Arc::new(make_pod("default", "a", ""))).is_none());
        let old = store.upsert(Arc::new(make_pod("default", "a", "node-1")));
        assert!(old.is_some());
        assert_eq!(store.len(), 1);

        let key = ObjectKey::new("default", "a");
        assert_eq!(pod::node_name(&store.get(&key).unwrap()), "node-1");
        assert!(store.remove(&key).is_some());
        assert!(store.remove(&key).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_node_index_follows_updates() {
        let store = Store::<Pod>::new()
            .with_indexer(INDEX_NODE_NAME, index_pods_by_node())
            .with_indexer(INDEX_NAMESPACE, index_by_namespace());

        store.upsert(Arc::new(make_pod("default", "a", "node-1")));
        store.upsert(Arc::new(make_pod("prod", "b", "node-1")));
        store.upsert(Arc::new(make_pod("prod", "c", "")));
        assert_eq!(store.by_index(INDEX_NODE_NAME, "node-1").len(), 2);
        assert_eq!(store.by_index(INDEX_NAMESPACE, "prod").len(), 2);

        // Moving a pod moves its index entry
        store.upsert(Arc::new(make_pod("default", "a", "node-2")));
        assert_eq!(store.by_index(INDEX_NODE_NAME, "node-1").len(), 1);
        assert_eq!(store.by_index(INDEX_NODE_NAME, "node-2").len(), 1);

        store.remove(&ObjectKey::new("prod", "b"));
        assert!(store.by_index(INDEX_NODE_NAME, "node-1").is_empty());
        assert!(store.by_index("missing", "x").is_empty());
    }

    #[test]
    fn test_controller_index_added_late() {
        let store = Store::<Pod>::new();
        let mut owned = make_pod("default", "web-0", "");
        owned.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            name: "web".to_string(),
            uid: "set-uid".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        store.upsert(Arc::new(owned));
        store.upsert(Arc::new(make_pod("default", "stray", "")));

        store.add_indexer(INDEX_CONTROLLER_UID, index_by_controller_uid());
        let found = store.by_index(INDEX_CONTROLLER_UID, "set-uid");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name(), "web-0");
    }
}
