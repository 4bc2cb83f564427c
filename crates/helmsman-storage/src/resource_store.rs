use crate::encoding::{KeyEncoder, META_PREFIX, REVISION_KEY};
use crate::kv::KVStore;
use crate::watchable::{
    DeleteOptions, DeleteOutcome, ListOptions, ListResult, PropagationPolicy, WatchStream,
    WatchableKV,
};
use crate::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use futures_util::{future, stream, StreamExt};
use helmsman_core::resources::pod::{
    DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS, PHASE_FAILED, PHASE_SUCCEEDED,
};
use helmsman_core::{
    is_valid_name, Clock, GroupVersionKind, HelmsmanError, ObjectKey, ResourceEvent, ResourceKey,
    ResourceVersion, Result, WatchEventType,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Finalizer held by an owner while its dependents are deleted first
pub const FINALIZER_FOREGROUND: &str = "foregroundDeletion";

pub const DEFAULT_NAMESPACE: &str = "default";

/// Server-owned metadata that update requests cannot change
const SERVER_FIELDS: &[&str] = &[
    "uid",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

#[derive(Debug, Clone)]
pub struct ResourceStoreConfig {
    /// Number of recent events kept for watch replay
    pub history_size: usize,
    /// Capacity of the live event channel; slower watchers are expired
    pub channel_capacity: usize,
}

impl Default for ResourceStoreConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            channel_capacity: 1024,
        }
    }
}

struct WriteState {
    revision: u64,
    history: VecDeque<ResourceEvent>,
    /// Watches from a revision below this can no longer be replayed
    floor: u64,
}

/// Revisioned object store over a [`KVStore`].
///
/// Every committed write takes the next value of a single global revision
/// counter, which is persisted alongside the object in the same transaction.
/// Writes are serialized; reads go straight to the backend.
pub struct ResourceStore {
    kv: Arc<dyn KVStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<WriteState>,
    events: broadcast::Sender<ResourceEvent>,
    config: ResourceStoreConfig,
}

impl ResourceStore {
    pub fn new(kv: Arc<dyn KVStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_config(kv, clock, ResourceStoreConfig::default())
    }

    pub fn with_config(
        kv: Arc<dyn KVStore>,
        clock: Arc<dyn Clock>,
        config: ResourceStoreConfig,
    ) -> Result<Self> {
        let revision = match kv.get(REVISION_KEY.as_bytes())? {
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| {
                    StorageError::corrupt_record(REVISION_KEY, "revision counter is not a number")
                })?,
            None => 0,
        };
        info!("Opened resource store at revision {}", revision);

        let (events, _) = broadcast::channel(config.channel_capacity.max(1));
        Ok(Self {
            kv,
            clock,
            state: Mutex::new(WriteState {
                revision,
                history: VecDeque::new(),
                floor: revision,
            }),
            events,
            config,
        })
    }

    pub fn current_revision(&self) -> ResourceVersion {
        ResourceVersion(self.state.lock().revision)
    }

    fn read(&self, key: &ResourceKey) -> Result<Option<Value>> {
        let storage_key = KeyEncoder::encode_resource_key(key);
        match self.kv.get(storage_key.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn read_existing(&self, key: &ResourceKey) -> Result<Value> {
        self.read(key)?
            .ok_or_else(|| HelmsmanError::not_found(key.to_string()))
    }

    /// Persist one change at the next revision and publish it
    fn commit(
        &self,
        state: &mut WriteState,
        event_type: WatchEventType,
        key: &ResourceKey,
        mut object: Value,
    ) -> Result<Value> {
        let rv = ResourceVersion(state.revision).next();
        set_meta(&mut object, "resourceVersion", Value::String(rv.to_string()));

        let storage_key = KeyEncoder::encode_resource_key(key);
        let mut txn = self.kv.transaction()?;
        match event_type {
            WatchEventType::Deleted => txn.delete(storage_key.as_bytes())?,
            _ => txn.put(storage_key.as_bytes(), &serde_json::to_vec(&object)?)?,
        }
        txn.put(REVISION_KEY.as_bytes(), rv.to_string().as_bytes())?;
        txn.commit()?;
        state.revision = rv.as_u64();

        debug!("{:?} {} at revision {}", event_type, key, rv);

        let event = match event_type {
            WatchEventType::Added => ResourceEvent::added(key.clone(), object.clone(), rv),
            WatchEventType::Modified => ResourceEvent::modified(key.clone(), object.clone(), rv),
            WatchEventType::Deleted => ResourceEvent::deleted(key.clone(), object.clone(), rv),
        };
        state.history.push_back(event.clone());
        while state.history.len() > self.config.history_size {
            if let Some(old) = state.history.pop_front() {
                state.floor = old.resource_version.as_u64();
            }
        }
        // No receivers is fine
        let _ = self.events.send(event);

        Ok(object)
    }

    fn create_object(&self, gvk: &GroupVersionKind, mut object: Value) -> Result<Value> {
        let key = normalize(gvk, &mut object)?;
        let mut state = self.state.lock();

        if self.read(&key)?.is_some() {
            return Err(HelmsmanError::already_exists(key.to_string()));
        }

        set_meta(&mut object, "uid", Value::String(Uuid::new_v4().to_string()));
        set_meta(&mut object, "creationTimestamp", timestamp(self.clock.now()));
        set_meta(&mut object, "generation", json!(1));
        set_meta(&mut object, "deletionTimestamp", Value::Null);
        set_meta(&mut object, "deletionGracePeriodSeconds", Value::Null);

        info!("Creating {}", key);
        self.commit(&mut state, WatchEventType::Added, &key, object)
    }

    fn update_object(&self, gvk: &GroupVersionKind, mut object: Value) -> Result<Value> {
        let key = normalize(gvk, &mut object)?;
        let mut state = self.state.lock();
        let existing = self.read_existing(&key)?;

        check_preconditions(
            &key,
            &existing,
            meta_str(&object, "uid"),
            requested_version(&object)?,
        )?;

        for field in SERVER_FIELDS {
            let value = meta_field(&existing, field).cloned().unwrap_or(Value::Null);
            set_meta(&mut object, field, value);
        }
        set_top(&mut object, "status", existing.get("status").cloned());

        let generation = meta_field(&existing, "generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if desired_state(&object) != desired_state(&existing) {
            generation + 1
        } else {
            generation
        };
        set_meta(&mut object, "generation", json!(generation));
        set_meta(
            &mut object,
            "resourceVersion",
            meta_field(&existing, "resourceVersion")
                .cloned()
                .unwrap_or(Value::Null),
        );

        if object == existing {
            debug!("Update of {} is a no-op", key);
            return Ok(existing);
        }

        if is_terminating(&object) && finalizers(&object).is_empty() && grace_of(&object) == 0 {
            info!("Last finalizer removed from {}, deleting", key);
            return self.remove(&mut state, &key, object);
        }

        self.commit(&mut state, WatchEventType::Modified, &key, object)
    }

    fn update_object_status(&self, gvk: &GroupVersionKind, mut object: Value) -> Result<Value> {
        let key = normalize(gvk, &mut object)?;
        let mut state = self.state.lock();
        let existing = self.read_existing(&key)?;

        check_preconditions(
            &key,
            &existing,
            meta_str(&object, "uid"),
            requested_version(&object)?,
        )?;

        let mut next = existing.clone();
        set_top(&mut next, "status", object.get("status").cloned());
        if next == existing {
            debug!("Status update of {} is a no-op", key);
            return Ok(existing);
        }

        self.commit(&mut state, WatchEventType::Modified, &key, next)
    }

    fn delete_object(
        &self,
        state: &mut WriteState,
        key: &ResourceKey,
        opts: &DeleteOptions,
    ) -> Result<DeleteOutcome> {
        let mut object = self.read_existing(key)?;
        check_preconditions(
            key,
            &object,
            opts.preconditions.uid.as_deref(),
            opts.preconditions.resource_version,
        )?;

        let grace = effective_grace(key, &object, opts.grace_period_seconds);
        let now = self.clock.now();

        if is_terminating(&object) {
            return self.shorten_deletion(state, key, object, grace, now);
        }

        let uid = meta_str(&object, "uid").unwrap_or_default().to_string();
        if opts.propagation_policy == PropagationPolicy::Orphan && !uid.is_empty() {
            self.orphan_dependents(state, &uid)?;
        }

        let mut held = finalizers(&object);
        if opts.propagation_policy == PropagationPolicy::Foreground
            && !held.iter().any(|f| f == FINALIZER_FOREGROUND)
        {
            held.push(FINALIZER_FOREGROUND.to_string());
            set_finalizers(&mut object, &held);
        }

        if grace == 0 && held.is_empty() {
            info!("Deleting {}", key);
            return Ok(DeleteOutcome::Deleted(self.remove(state, key, object)?));
        }

        set_meta(
            &mut object,
            "deletionTimestamp",
            timestamp(now + Duration::seconds(grace)),
        );
        set_meta(&mut object, "deletionGracePeriodSeconds", json!(grace));
        info!(
            "Marking {} terminating (grace {}s, finalizers {:?})",
            key, grace, held
        );
        let marked = self.commit(state, WatchEventType::Modified, key, object)?;

        if opts.propagation_policy != PropagationPolicy::Foreground {
            return Ok(DeleteOutcome::Terminating(marked));
        }

        for (dependent, _) in self.dependents(&uid)? {
            self.delete_dependent(state, &dependent, key);
        }
        if let Some(removed) = self.finish_foreground(state, key, &uid)? {
            return Ok(DeleteOutcome::Deleted(removed));
        }
        Ok(match self.read(key)? {
            Some(current) => DeleteOutcome::Terminating(current),
            None => DeleteOutcome::Deleted(marked),
        })
    }

    /// A repeated delete on a terminating object may only bring its deadline forward
    fn shorten_deletion(
        &self,
        state: &mut WriteState,
        key: &ResourceKey,
        mut object: Value,
        grace: i64,
        now: DateTime<Utc>,
    ) -> Result<DeleteOutcome> {
        if grace == 0 && finalizers(&object).is_empty() {
            info!("Force deleting terminating {}", key);
            return Ok(DeleteOutcome::Deleted(self.remove(state, key, object)?));
        }
        if grace >= grace_of(&object) {
            return Ok(DeleteOutcome::Terminating(object));
        }

        let deadline = now + Duration::seconds(grace);
        let deadline = match deletion_timestamp(&object) {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        set_meta(&mut object, "deletionTimestamp", timestamp(deadline));
        set_meta(&mut object, "deletionGracePeriodSeconds", json!(grace));
        let object = self.commit(state, WatchEventType::Modified, key, object)?;
        Ok(DeleteOutcome::Terminating(object))
    }

    /// Remove the object, then cascade to its dependents and release any
    /// owner waiting on it in foreground deletion
    fn remove(&self, state: &mut WriteState, key: &ResourceKey, object: Value) -> Result<Value> {
        let removed = self.commit(state, WatchEventType::Deleted, key, object)?;

        if let Some(uid) = meta_str(&removed, "uid") {
            for (dependent, _) in self.dependents(uid)? {
                self.delete_dependent(state, &dependent, key);
            }
        }

        for (owner_key, owner_uid) in owners(&removed, key) {
            self.finish_foreground(state, &owner_key, &owner_uid)?;
        }
        Ok(removed)
    }

    fn delete_dependent(&self, state: &mut WriteState, dependent: &ResourceKey, owner: &ResourceKey) {
        match self.delete_object(state, dependent, &DeleteOptions::default()) {
            Ok(_) => debug!("Deleted dependent {} of {}", dependent, owner),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Failed to delete dependent {} of {}: {}", dependent, owner, e),
        }
    }

    /// Drop the foreground finalizer once an owner has no dependents left
    fn finish_foreground(
        &self,
        state: &mut WriteState,
        key: &ResourceKey,
        uid: &str,
    ) -> Result<Option<Value>> {
        let Some(mut owner) = self.read(key)? else {
            return Ok(None);
        };
        if meta_str(&owner, "uid") != Some(uid) || !is_terminating(&owner) {
            return Ok(None);
        }
        let mut held = finalizers(&owner);
        if !held.iter().any(|f| f == FINALIZER_FOREGROUND) {
            return Ok(None);
        }
        if !self.dependents(uid)?.is_empty() {
            return Ok(None);
        }

        held.retain(|f| f != FINALIZER_FOREGROUND);
        set_finalizers(&mut owner, &held);
        if held.is_empty() && grace_of(&owner) == 0 {
            info!("All dependents of {} are gone, deleting", key);
            return Ok(Some(self.remove(state, key, owner)?));
        }
        self.commit(state, WatchEventType::Modified, key, owner)?;
        Ok(None)
    }

    fn orphan_dependents(&self, state: &mut WriteState, owner_uid: &str) -> Result<()> {
        for (key, mut object) in self.dependents(owner_uid)? {
            let mut refs = meta_field(&object, "ownerReferences")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            refs.retain(|r| r["uid"].as_str() != Some(owner_uid));
            let refs = if refs.is_empty() {
                Value::Null
            } else {
                Value::Array(refs)
            };
            set_meta(&mut object, "ownerReferences", refs);
            debug!("Orphaning {}", key);
            self.commit(state, WatchEventType::Modified, &key, object)?;
        }
        Ok(())
    }

    /// Every stored object with an owner reference to `owner_uid`
    fn dependents(&self, owner_uid: &str) -> Result<Vec<(ResourceKey, Value)>> {
        let mut out = Vec::new();
        for (raw_key, raw) in self.kv.scan(b"")? {
            let Ok(storage_key) = std::str::from_utf8(&raw_key) else {
                continue;
            };
            if storage_key.starts_with(META_PREFIX) {
                continue;
            }
            let Some(key) = KeyEncoder::parse_key(storage_key) else {
                continue;
            };
            let object: Value = serde_json::from_slice(&raw)?;
            let owned = meta_field(&object, "ownerReferences")
                .and_then(Value::as_array)
                .is_some_and(|refs| refs.iter().any(|r| r["uid"].as_str() == Some(owner_uid)));
            if owned {
                out.push((key, object));
            }
        }
        Ok(out)
    }

    fn list_objects(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> Result<ListResult> {
        // Holding the write lock keeps the items and the revision consistent
        let state = self.state.lock();
        let namespace = opts.namespace.as_deref().filter(|_| gvk.is_namespaced());
        let prefix = KeyEncoder::encode_prefix(gvk, namespace);

        let mut items = Vec::new();
        for (_, raw) in self.kv.scan(prefix.as_bytes())? {
            let object: Value = serde_json::from_slice(&raw)?;
            if opts.matches(&object) {
                items.push(object);
            }
        }
        Ok(ListResult {
            items,
            resource_version: ResourceVersion(state.revision),
        })
    }
}

#[async_trait]
impl WatchableKV for ResourceStore {
    async fn list(&self, gvk: &GroupVersionKind, opts: &ListOptions) -> Result<ListResult> {
        self.list_objects(gvk, opts)
    }

    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        since: ResourceVersion,
        opts: &ListOptions,
    ) -> Result<WatchStream> {
        // Subscribing under the lock means no event falls between replay and live
        let (backlog, rx) = {
            let state = self.state.lock();
            if since.as_u64() < state.floor {
                return Err(HelmsmanError::expired(since.to_string()));
            }
            let backlog: Vec<ResourceEvent> = state
                .history
                .iter()
                .filter(|e| e.resource_version > since)
                .cloned()
                .collect();
            (backlog, self.events.subscribe())
        };
        debug!(
            "Watching {} from revision {} ({} replayed)",
            gvk,
            since,
            backlog.len()
        );

        let live = BroadcastStream::new(rx).map(move |item| {
            item.map_err(|e| HelmsmanError::expired(format!("{} ({})", since, e)))
        });
        let gvk = gvk.clone();
        let opts = opts.clone();
        let events = stream::iter(backlog.into_iter().map(Ok::<_, HelmsmanError>))
            .chain(live)
            .filter(move |item| {
                future::ready(match item {
                    Ok(event) => event.gvk == gvk && opts.matches(&event.object),
                    Err(_) => true,
                })
            });
        Ok(events.boxed())
    }

    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<Value> {
        self.read_existing(&ResourceKey::from_object_key(gvk.clone(), key))
    }

    async fn create(&self, gvk: &GroupVersionKind, object: Value) -> Result<Value> {
        self.create_object(gvk, object)
    }

    async fn update(&self, gvk: &GroupVersionKind, object: Value) -> Result<Value> {
        self.update_object(gvk, object)
    }

    async fn update_status(&self, gvk: &GroupVersionKind, object: Value) -> Result<Value> {
        self.update_object_status(gvk, object)
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
        opts: &DeleteOptions,
    ) -> Result<DeleteOutcome> {
        let key = ResourceKey::from_object_key(gvk.clone(), key);
        let mut state = self.state.lock();
        self.delete_object(&mut state, &key, opts)
    }
}

/// Stamp apiVersion/kind, default the namespace and derive the key
fn normalize(gvk: &GroupVersionKind, object: &mut Value) -> Result<ResourceKey> {
    let not_a_map = || {
        HelmsmanError::invalid(
            "object is not a JSON map",
            "Submit a serialized resource object",
        )
    };
    let map = object.as_object_mut().ok_or_else(not_a_map)?;
    map.insert("apiVersion".to_string(), Value::String(gvk.api_version()));
    map.insert("kind".to_string(), Value::String(gvk.kind.clone()));

    let meta = map
        .entry("metadata")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(not_a_map)?;

    let name = meta
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if !is_valid_name(&name) {
        return Err(HelmsmanError::invalid(
            format!("invalid {} name '{}'", gvk.kind, name),
            "Names must be lowercase DNS-1123 subdomains",
        ));
    }

    let namespace = if gvk.is_namespaced() {
        let ns = meta
            .get("namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
            .to_string();
        meta.insert("namespace".to_string(), Value::String(ns.clone()));
        ns
    } else {
        meta.remove("namespace");
        String::new()
    };

    Ok(ResourceKey::new(gvk.clone(), namespace, name))
}

fn check_preconditions(
    key: &ResourceKey,
    stored: &Value,
    uid: Option<&str>,
    resource_version: Option<ResourceVersion>,
) -> Result<()> {
    if let Some(uid) = uid.filter(|u| !u.is_empty()) {
        let current = meta_str(stored, "uid").unwrap_or_default();
        if current != uid {
            return Err(HelmsmanError::conflict(
                key.to_string(),
                format!("uid precondition failed: stored {}, requested {}", current, uid),
            ));
        }
    }
    if let Some(rv) = resource_version {
        let current = meta_str(stored, "resourceVersion").unwrap_or_default();
        if current != rv.to_string() {
            return Err(HelmsmanError::conflict(
                key.to_string(),
                format!(
                    "the object has been modified: stored revision {}, requested {}",
                    current, rv
                ),
            ));
        }
    }
    Ok(())
}

fn requested_version(object: &Value) -> Result<Option<ResourceVersion>> {
    meta_str(object, "resourceVersion")
        .filter(|rv| !rv.is_empty())
        .map(|rv| rv.parse::<ResourceVersion>())
        .transpose()
}

/// Grace period applied to a delete; only bound, non-terminal pods get one
fn effective_grace(key: &ResourceKey, object: &Value, requested: Option<i64>) -> i64 {
    if key.gvk.kind != "Pod" || !key.gvk.group.is_empty() {
        return 0;
    }
    let spec = &object["spec"];
    let node = spec["nodeName"].as_str().unwrap_or_default();
    let phase = object["status"]["phase"].as_str().unwrap_or_default();
    if node.is_empty() || phase == PHASE_SUCCEEDED || phase == PHASE_FAILED {
        return 0;
    }
    requested
        .or_else(|| spec["terminationGracePeriodSeconds"].as_i64())
        .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS)
        .max(0)
}

/// Everything except metadata and status
fn desired_state(object: &Value) -> Value {
    let mut copy = object.clone();
    if let Some(map) = copy.as_object_mut() {
        for field in ["metadata", "status", "apiVersion", "kind"] {
            map.remove(field);
        }
    }
    copy
}

fn owners(object: &Value, key: &ResourceKey) -> Vec<(ResourceKey, String)> {
    let Some(refs) = meta_field(object, "ownerReferences").and_then(Value::as_array) else {
        return Vec::new();
    };
    refs.iter()
        .filter_map(|r| {
            let gvk = GroupVersionKind::from_api_version_kind(
                r["apiVersion"].as_str()?,
                r["kind"].as_str()?,
            );
            let namespace = if gvk.is_namespaced() {
                key.namespace.clone()
            } else {
                String::new()
            };
            let name = r["name"].as_str()?;
            let uid = r["uid"].as_str()?.to_string();
            Some((ResourceKey::new(gvk, namespace, name), uid))
        })
        .collect()
}

fn timestamp(t: DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn meta_field<'a>(object: &'a Value, field: &str) -> Option<&'a Value> {
    object
        .get("metadata")?
        .get(field)
        .filter(|v| !v.is_null())
}

fn meta_str<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    meta_field(object, field)?.as_str()
}

fn set_meta(object: &mut Value, field: &str, value: Value) {
    if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        if value.is_null() {
            meta.remove(field);
        } else {
            meta.insert(field.to_string(), value);
        }
    }
}

fn set_top(object: &mut Value, field: &str, value: Option<Value>) {
    if let Some(map) = object.as_object_mut() {
        match value {
            Some(v) if !v.is_null() => {
                map.insert(field.to_string(), v);
            }
            _ => {
                map.remove(field);
            }
        }
    }
}

fn finalizers(object: &Value) -> Vec<String> {
    meta_field(object, "finalizers")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn set_finalizers(object: &mut Value, finalizers: &[String]) {
    let value = if finalizers.is_empty() {
        Value::Null
    } else {
        json!(finalizers)
    };
    set_meta(object, "finalizers", value);
}

fn is_terminating(object: &Value) -> bool {
    meta_field(object, "deletionTimestamp").is_some()
}

fn deletion_timestamp(object: &Value) -> Option<DateTime<Utc>> {
    let raw = meta_str(object, "deletionTimestamp")?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn grace_of(object: &Value) -> i64 {
    meta_field(object, "deletionGracePeriodSeconds")
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RedbBackend;
    use chrono::TimeZone;
    use helmsman_core::FakeClock;
    use tempfile::tempdir;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn make_store() -> (ResourceStore, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(start()));
        let store = ResourceStore::new(
            Arc::new(RedbBackend::in_memory().unwrap()),
            clock.clone(),
        )
        .unwrap();
        (store, clock)
    }

    fn pods() -> GroupVersionKind {
        GroupVersionKind::from_api_version_kind("v1", "Pod")
    }

    fn jobs() -> GroupVersionKind {
        GroupVersionKind::from_api_version_kind("batch/v1", "Job")
    }

    fn pod(name: &str, node: Option<&str>) -> Value {
        let mut pod = json!({
            "metadata": {"name": name, "namespace": "default", "labels": {"app": "web"}},
            "spec": {"containers": [{"name": "app", "image": "nginx"}]}
        });
        if let Some(node) = node {
            pod["spec"]["nodeName"] = json!(node);
        }
        pod
    }

    fn owned_by(mut object: Value, owner: &Value) -> Value {
        object["metadata"]["ownerReferences"] = json!([{
            "apiVersion": owner["apiVersion"],
            "kind": owner["kind"],
            "name": owner["metadata"]["name"],
            "uid": owner["metadata"]["uid"],
            "controller": true
        }]);
        object
    }

    #[tokio::test]
    async fn test_create_assigns_server_fields() {
        let (store, _) = make_store();

        let created = store.create(&pods(), pod("web-0", None)).await.unwrap();
        assert_eq!(created["kind"], "Pod");
        assert_eq!(created["apiVersion"], "v1");
        assert_eq!(created["metadata"]["generation"], 1);
        assert_eq!(created["metadata"]["resourceVersion"], "1");
        assert_eq!(created["metadata"]["creationTimestamp"], "2024-05-01T12:00:00Z");
        assert!(created["metadata"]["uid"].as_str().is_some());

        let err = store.create(&pods(), pod("web-0", None)).await.unwrap_err();
        assert!(err.is_already_exists());

        let err = store.create(&pods(), pod("Web_0", None)).await.unwrap_err();
        assert!(matches!(err, HelmsmanError::Invalid { .. }));

        let mut no_ns = pod("web-1", None);
        no_ns["metadata"].as_object_mut().unwrap().remove("namespace");
        let created = store.create(&pods(), no_ns).await.unwrap();
        assert_eq!(created["metadata"]["namespace"], DEFAULT_NAMESPACE);
    }

    #[tokio::test]
    async fn test_update_conflicts_and_generation() {
        let (store, _) = make_store();
        let created = store.create(&pods(), pod("web-0", None)).await.unwrap();

        // Label change: new revision, same generation
        let mut relabeled = created.clone();
        relabeled["metadata"]["labels"]["tier"] = json!("front");
        let updated = store.update(&pods(), relabeled).await.unwrap();
        assert_eq!(updated["metadata"]["resourceVersion"], "2");
        assert_eq!(updated["metadata"]["generation"], 1);

        // Stale resourceVersion
        let err = store.update(&pods(), created.clone()).await.unwrap_err();
        assert!(err.is_conflict());

        // Spec change bumps generation; status in the body is ignored
        let mut respec = updated.clone();
        respec["spec"]["nodeName"] = json!("node-1");
        respec["status"] = json!({"phase": "Running"});
        let updated = store.update(&pods(), respec).await.unwrap();
        assert_eq!(updated["metadata"]["generation"], 2);
        assert!(updated.get("status").is_none());

        // Unchanged body writes nothing
        let again = store.update(&pods(), updated.clone()).await.unwrap();
        assert_eq!(again["metadata"]["resourceVersion"], updated["metadata"]["resourceVersion"]);
        assert_eq!(store.current_revision(), ResourceVersion(3));
    }

    #[tokio::test]
    async fn test_update_status_only_touches_status() {
        let (store, _) = make_store();
        let created = store.create(&pods(), pod("web-0", None)).await.unwrap();

        let mut body = created.clone();
        body["spec"]["nodeName"] = json!("node-9");
        body["status"] = json!({"phase": "Running", "podIP": "10.0.0.5"});
        let updated = store.update_status(&pods(), body).await.unwrap();

        assert_eq!(updated["status"]["phase"], "Running");
        assert!(updated["spec"].get("nodeName").is_none());
        assert_eq!(updated["metadata"]["generation"], 1);
    }

    #[tokio::test]
    async fn test_pod_deletion_grace_periods() {
        let (store, clock) = make_store();
        let key = ObjectKey::new("default", "bound");

        let mut bound = pod("bound", Some("node-1"));
        bound["spec"]["terminationGracePeriodSeconds"] = json!(45);
        store.create(&pods(), bound).await.unwrap();

        let outcome = store.delete(&pods(), &key, &DeleteOptions::default()).await.unwrap();
        let obj = match outcome {
            DeleteOutcome::Terminating(obj) => obj,
            other => panic!("expected terminating, got {:?}", other),
        };
        assert_eq!(obj["metadata"]["deletionTimestamp"], "2024-05-01T12:00:45Z");
        assert_eq!(obj["metadata"]["deletionGracePeriodSeconds"], 45);

        // A longer grace does not extend the deadline, a shorter one brings it forward
        clock.advance(Duration::seconds(5));
        let outcome = store.delete(&pods(), &key, &DeleteOptions::with_grace(60)).await.unwrap();
        assert_eq!(
            outcome.into_object()["metadata"]["deletionTimestamp"],
            "2024-05-01T12:00:45Z"
        );
        let outcome = store.delete(&pods(), &key, &DeleteOptions::with_grace(10)).await.unwrap();
        assert_eq!(
            outcome.into_object()["metadata"]["deletionTimestamp"],
            "2024-05-01T12:00:15Z"
        );

        let outcome = store.delete(&pods(), &key, &DeleteOptions::force()).await.unwrap();
        assert!(outcome.is_deleted());
        assert!(store.get(&pods(), &key).await.unwrap_err().is_not_found());

        // Unscheduled pods go immediately
        store.create(&pods(), pod("pending", None)).await.unwrap();
        let outcome = store
            .delete(&pods(), &ObjectKey::new("default", "pending"), &DeleteOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_deleted());
    }

    #[tokio::test]
    async fn test_delete_uid_precondition() {
        let (store, _) = make_store();
        store.create(&pods(), pod("web-0", None)).await.unwrap();
        let key = ObjectKey::new("default", "web-0");

        let err = store
            .delete(&pods(), &key, &DeleteOptions::default().with_uid("someone-else"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store.get(&pods(), &key).await.is_ok());
    }

    #[tokio::test]
    async fn test_finalizers_hold_deletion() {
        let (store, _) = make_store();
        let mut job = json!({"metadata": {"name": "batch-1", "namespace": "default"}});
        job["metadata"]["finalizers"] = json!(["example.com/cleanup"]);
        store.create(&jobs(), job).await.unwrap();
        let key = ObjectKey::new("default", "batch-1");

        let outcome = store.delete(&jobs(), &key, &DeleteOptions::default()).await.unwrap();
        assert!(!outcome.is_deleted());

        let mut current = store.get(&jobs(), &key).await.unwrap();
        current["metadata"]["finalizers"] = json!([]);
        store.update(&jobs(), current).await.unwrap();
        assert!(store.get(&jobs(), &key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_propagation_policies() {
        let (store, _) = make_store();

        // Background: dependents follow the owner
        let job = store
            .create(&jobs(), json!({"metadata": {"name": "bg", "namespace": "default"}}))
            .await
            .unwrap();
        store.create(&pods(), owned_by(pod("bg-a", None), &job)).await.unwrap();
        store
            .delete(&jobs(), &ObjectKey::new("default", "bg"), &DeleteOptions::default())
            .await
            .unwrap();
        assert!(store
            .get(&pods(), &ObjectKey::new("default", "bg-a"))
            .await
            .unwrap_err()
            .is_not_found());

        // Orphan: dependents stay, reference stripped
        let job = store
            .create(&jobs(), json!({"metadata": {"name": "or", "namespace": "default"}}))
            .await
            .unwrap();
        store.create(&pods(), owned_by(pod("or-a", None), &job)).await.unwrap();
        let opts = DeleteOptions::default().with_propagation(PropagationPolicy::Orphan);
        store
            .delete(&jobs(), &ObjectKey::new("default", "or"), &opts)
            .await
            .unwrap();
        let orphan = store.get(&pods(), &ObjectKey::new("default", "or-a")).await.unwrap();
        assert!(orphan["metadata"].get("ownerReferences").is_none());

        // Foreground: owner waits for a terminating dependent
        let job = store
            .create(&jobs(), json!({"metadata": {"name": "fg", "namespace": "default"}}))
            .await
            .unwrap();
        store
            .create(&pods(), owned_by(pod("fg-a", Some("node-1")), &job))
            .await
            .unwrap();
        let opts = DeleteOptions::default().with_propagation(PropagationPolicy::Foreground);
        let outcome = store
            .delete(&jobs(), &ObjectKey::new("default", "fg"), &opts)
            .await
            .unwrap();
        assert!(!outcome.is_deleted());
        let owner = outcome.into_object();
        assert_eq!(owner["metadata"]["finalizers"], json!([FINALIZER_FOREGROUND]));

        store
            .delete(&pods(), &ObjectKey::new("default", "fg-a"), &DeleteOptions::force())
            .await
            .unwrap();
        assert!(store
            .get(&jobs(), &ObjectKey::new("default", "fg"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_and_revision() {
        let (store, _) = make_store();
        store.create(&pods(), pod("a", None)).await.unwrap();
        let mut other = pod("b", None);
        other["metadata"]["namespace"] = json!("kube-system");
        store.create(&pods(), other).await.unwrap();
        store
            .create(&jobs(), json!({"metadata": {"name": "j", "namespace": "default"}}))
            .await
            .unwrap();

        let all = store.list(&pods(), &ListOptions::default()).await.unwrap();
        assert_eq!(all.items.len(), 2);
        assert_eq!(all.resource_version, ResourceVersion(3));

        let scoped = store
            .list(&pods(), &ListOptions::in_namespace("kube-system"))
            .await
            .unwrap();
        assert_eq!(scoped.items.len(), 1);
        assert_eq!(scoped.items[0]["metadata"]["name"], "b");
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams() {
        let (store, _) = make_store();
        let listed = store.list(&pods(), &ListOptions::default()).await.unwrap();

        store.create(&pods(), pod("a", None)).await.unwrap();
        store
            .create(&jobs(), json!({"metadata": {"name": "j", "namespace": "default"}}))
            .await
            .unwrap();

        let mut watch = store
            .watch(&pods(), listed.resource_version, &ListOptions::default())
            .await
            .unwrap();

        let replayed = watch.next().await.unwrap().unwrap();
        assert_eq!(replayed.event_type, WatchEventType::Added);
        assert_eq!(replayed.resource_key.name, "a");

        store
            .delete(&pods(), &ObjectKey::new("default", "a"), &DeleteOptions::default())
            .await
            .unwrap();
        let live = watch.next().await.unwrap().unwrap();
        assert_eq!(live.event_type, WatchEventType::Deleted);
        assert_eq!(live.resource_version, ResourceVersion(3));
    }

    #[tokio::test]
    async fn test_watch_expired_when_history_trimmed() {
        let clock = Arc::new(FakeClock::new(start()));
        let store = ResourceStore::with_config(
            Arc::new(RedbBackend::in_memory().unwrap()),
            clock,
            ResourceStoreConfig {
                history_size: 2,
                channel_capacity: 16,
            },
        )
        .unwrap();

        for name in ["a", "b", "c", "d"] {
            store.create(&pods(), pod(name, None)).await.unwrap();
        }

        let err = store
            .watch(&pods(), ResourceVersion(1), &ListOptions::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_expired());
        assert!(store
            .watch(&pods(), ResourceVersion(2), &ListOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_revision_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let clock = Arc::new(FakeClock::new(start()));

        {
            let store =
                ResourceStore::new(Arc::new(RedbBackend::new(&path).unwrap()), clock.clone())
                    .unwrap();
            store.create(&pods(), pod("a", None)).await.unwrap();
            store.create(&pods(), pod("b", None)).await.unwrap();
        }

        let store = ResourceStore::new(Arc::new(RedbBackend::new(&path).unwrap()), clock).unwrap();
        assert_eq!(store.current_revision(), ResourceVersion(2));
        let created = store.create(&pods(), pod("c", None)).await.unwrap();
        assert_eq!(created["metadata"]["resourceVersion"], "3");
    }
}
