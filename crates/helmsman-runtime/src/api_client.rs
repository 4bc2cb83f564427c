use futures_util::{Stream, StreamExt};
use helmsman_core::{
    from_value, to_value, HelmsmanError, ObjectKey, Resource, ResourceVersion, Result,
    WatchEventType,
};
use helmsman_storage::{DeleteOptions, DeleteOutcome, ListOptions, WatchableKV};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default per-call deadline for storage calls
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed client the controllers use to talk to the storage backend.
///
/// Every call runs under a deadline; expiry surfaces as `ServerTimeout`.
#[derive(Clone)]
pub struct ApiClient {
    backend: Arc<dyn WatchableKV>,
    timeout: Duration,
}

/// A typed change from a watch stream
#[derive(Debug, Clone)]
pub struct WatchEvent<T> {
    pub event_type: WatchEventType,
    pub object: T,
    pub resource_version: ResourceVersion,
}

/// A typed list snapshot
#[derive(Debug, Clone)]
pub struct ObjectList<T> {
    pub items: Vec<T>,
    pub resource_version: ResourceVersion,
}

impl ApiClient {
    pub fn new(backend: Arc<dyn WatchableKV>) -> Self {
        Self {
            backend,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backend(&self) -> &Arc<dyn WatchableKV> {
        &self.backend
    }

    async fn call<T>(&self, operation: String, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(HelmsmanError::server_timeout(operation, self.timeout)),
        }
    }

    pub async fn list<T: Resource>(&self, opts: &ListOptions) -> Result<ObjectList<T>> {
        let gvk = T::gvk();
        debug!("LIST {}", gvk);
        let result = self
            .call(format!("list {}", gvk), self.backend.list(&gvk, opts))
            .await?;
        let items = result
            .items
            .into_iter()
            .map(from_value)
            .collect::<Result<Vec<T>>>()?;
        Ok(ObjectList {
            items,
            resource_version: result.resource_version,
        })
    }

    /// Typed change stream starting after `since`
    pub async fn watch<T: Resource>(
        &self,
        since: ResourceVersion,
        opts: &ListOptions,
    ) -> Result<impl Stream<Item = Result<WatchEvent<T>>> + Send + 'static> {
        let gvk = T::gvk();
        debug!("WATCH {} from {}", gvk, since);
        let stream = self
            .call(format!("watch {}", gvk), self.backend.watch(&gvk, since, opts))
            .await?;
        Ok(stream.map(|item| -> Result<WatchEvent<T>> {
            let event = item?;
            Ok(WatchEvent {
                event_type: event.event_type,
                object: from_value(event.object)?,
                resource_version: event.resource_version,
            })
        }))
    }

    pub async fn get<T: Resource>(&self, key: &ObjectKey) -> Result<T> {
        let gvk = T::gvk();
        debug!("GET {} {}", gvk, key);
        let value = self
            .call(format!("get {} {}", gvk, key), self.backend.get(&gvk, key))
            .await?;
        from_value(value)
    }

    /// `Ok(None)` when the object does not exist
    pub async fn get_opt<T: Resource>(&self, key: &ObjectKey) -> Result<Option<T>> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create<T: Resource>(&self, object: &T) -> Result<T> {
        let gvk = T::gvk();
        debug!("CREATE {} {}", gvk, object.object_key());
        let value = to_value(object)?;
        let created = self
            .call(
                format!("create {} {}", gvk, object.object_key()),
                self.backend.create(&gvk, value),
            )
            .await?;
        from_value(created)
    }

    pub async fn update<T: Resource>(&self, object: &T) -> Result<T> {
        let gvk = T::gvk();
        debug!("UPDATE {} {}", gvk, object.object_key());
        let value = to_value(object)?;
        let updated = self
            .call(
                format!("update {} {}", gvk, object.object_key()),
                self.backend.update(&gvk, value),
            )
            .await?;
        from_value(updated)
    }

    pub async fn update_status<T: Resource>(&self, object: &T) -> Result<T> {
        let gvk = T::gvk();
        debug!("UPDATE STATUS {} {}", gvk, object.object_key());
        let value = to_value(object)?;
        let updated = self
            .call(
                format!("update status {} {}", gvk, object.object_key()),
                self.backend.update_status(&gvk, value),
            )
            .await?;
        from_value(updated)
    }

    pub async fn delete<T: Resource>(
        &self,
        key: &ObjectKey,
        opts: &DeleteOptions,
    ) -> Result<DeleteOutcome> {
        let gvk = T::gvk();
        debug!("DELETE {} {} {:?}", gvk, key, opts);
        self.call(
            format!("delete {} {}", gvk, key),
            self.backend.delete(&gvk, key, opts),
        )
        .await
    }
}
