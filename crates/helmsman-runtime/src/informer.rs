//! List+watch cache for one resource kind.
//!
//! The informer lists once, fills its [`Store`], then follows the watch
//! stream from the list's revision. When the stream ends or its revision
//! expires it backs off and relists, reconciling the store against the
//! fresh snapshot. Handlers run inline and must only enqueue keys.

use crate::api_client::{ApiClient, WatchEvent};
use crate::rate_limiter::Backoff;
use crate::store::Store;
use futures_util::StreamExt;
use helmsman_core::{Resource, ResourceVersion, Result, WatchEventType};
use helmsman_storage::ListOptions;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callbacks for cache changes
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, obj: &Arc<T>);
    fn on_update(&self, old: &Arc<T>, new: &Arc<T>);
    fn on_delete(&self, obj: &Arc<T>);
}

type AddFn<T> = Box<dyn Fn(&Arc<T>) + Send + Sync>;
type UpdateFn<T> = Box<dyn Fn(&Arc<T>, &Arc<T>) + Send + Sync>;

/// Closure-based handler; unset callbacks do nothing
pub struct EventHandlerFns<T> {
    add: Option<AddFn<T>>,
    update: Option<UpdateFn<T>>,
    delete: Option<AddFn<T>>,
}

impl<T> Default for EventHandlerFns<T> {
    fn default() -> Self {
        Self {
            add: None,
            update: None,
            delete: None,
        }
    }
}

impl<T> EventHandlerFns<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, f: impl Fn(&Arc<T>) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Arc<T>, &Arc<T>) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&Arc<T>) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<T: Send + Sync> EventHandler<T> for EventHandlerFns<T> {
    fn on_add(&self, obj: &Arc<T>) {
        if let Some(f) = &self.add {
            f(obj);
        }
    }

    fn on_update(&self, old: &Arc<T>, new: &Arc<T>) {
        if let Some(f) = &self.update {
            f(old, new);
        }
    }

    fn on_delete(&self, obj: &Arc<T>) {
        if let Some(f) = &self.delete {
            f(obj);
        }
    }
}

/// Anything that can report whether its initial list finished
pub trait Synced: Send + Sync {
    fn name(&self) -> String;
    fn has_synced(&self) -> bool;
    fn synced_receiver(&self) -> watch::Receiver<bool>;
}

/// Configuration for an informer
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Redeliver every cached object as an update this often
    pub resync_period: Option<Duration>,
    pub relist_backoff_initial: Duration,
    pub relist_backoff_max: Duration,
    pub list_options: ListOptions,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: None,
            relist_backoff_initial: Duration::from_millis(800),
            relist_backoff_max: Duration::from_secs(30),
            list_options: ListOptions::default(),
        }
    }
}

pub struct Informer<T: Resource> {
    client: ApiClient,
    store: Arc<Store<T>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<T>>>>,
    synced: watch::Sender<bool>,
    config: InformerConfig,
}

impl<T: Resource> Informer<T> {
    pub fn new(client: ApiClient, config: InformerConfig) -> Self {
        Self::with_store(client, config, Arc::new(Store::new()))
    }

    /// Use a pre-built store, typically one with indexers registered
    pub fn with_store(client: ApiClient, config: InformerConfig, store: Arc<Store<T>>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            client,
            store,
            handlers: RwLock::new(Vec::new()),
            synced,
            config,
        }
    }

    pub fn store(&self) -> &Arc<Store<T>> {
        &self.store
    }

    /// Register a handler. Objects already cached are replayed to it as adds.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler<T>>) {
        for obj in self.store.list() {
            handler.on_add(&obj);
        }
        self.handlers.write().push(handler);
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<T>>> {
        self.handlers.read().clone()
    }

    /// List and watch until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) {
        let kind = T::KIND;
        info!("Starting {} informer", kind);
        let mut backoff = Backoff::new(
            self.config.relist_backoff_initial,
            self.config.relist_backoff_max,
        );

        loop {
            let listed = tokio::select! {
                _ = token.cancelled() => break,
                r = self.list_into_store() => r,
            };

            match listed {
                Ok(rv) => match self.watch_from(rv, &token).await {
                    Ok(WatchEnd::Cancelled) => break,
                    Ok(WatchEnd::Closed { delivered }) => {
                        if delivered > 0 {
                            backoff.reset();
                        }
                        debug!("{} watch closed after {} events, relisting", kind, delivered);
                    }
                    Err(e) if e.is_expired() => {
                        info!("{} watch expired, relisting: {}", kind, e);
                    }
                    Err(e) => {
                        warn!("{} watch failed, relisting: {}", kind, e);
                    }
                },
                Err(e) => {
                    warn!("Failed to list {}: {}", kind, e);
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("{} informer stopped", kind);
    }

    /// List every object, bring the store in line with the snapshot, and
    /// mark the informer synced. Returns the snapshot's revision.
    pub async fn list_into_store(&self) -> Result<ResourceVersion> {
        let list = self.client.list::<T>(&self.config.list_options).await?;
        let handlers = self.handlers();
        let mut seen = HashSet::with_capacity(list.items.len());

        for obj in list.items {
            let obj = Arc::new(obj);
            seen.insert(obj.object_key());
            match self.store.upsert(obj.clone()) {
                Some(old) => handlers.iter().for_each(|h| h.on_update(&old, &obj)),
                None => handlers.iter().for_each(|h| h.on_add(&obj)),
            }
        }

        for key in self.store.keys() {
            if seen.contains(&key) {
                continue;
            }
            if let Some(gone) = self.store.remove(&key) {
                handlers.iter().for_each(|h| h.on_delete(&gone));
            }
        }

        debug!(
            "Listed {} {} objects at revision {}",
            self.store.len(),
            T::KIND,
            list.resource_version
        );
        self.synced.send_replace(true);
        Ok(list.resource_version)
    }

    async fn watch_from(&self, since: ResourceVersion, token: &CancellationToken) -> Result<WatchEnd> {
        let stream = self
            .client
            .watch::<T>(since, &self.config.list_options)
            .await?;
        tokio::pin!(stream);

        let mut resync = self.config.resync_period.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut delivered = 0usize;

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(WatchEnd::Cancelled),
                _ = tick(&mut resync) => self.resync(),
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        delivered += 1;
                        self.apply(event);
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(WatchEnd::Closed { delivered }),
                },
            }
        }
    }

    fn apply(&self, event: WatchEvent<T>) {
        let handlers = self.handlers();
        let obj = Arc::new(event.object);
        match event.event_type {
            WatchEventType::Added | WatchEventType::Modified => match self.store.upsert(obj.clone()) {
                Some(old) => handlers.iter().for_each(|h| h.on_update(&old, &obj)),
                None => handlers.iter().for_each(|h| h.on_add(&obj)),
            },
            WatchEventType::Deleted => {
                let gone = self.store.remove(&obj.object_key()).unwrap_or(obj);
                handlers.iter().for_each(|h| h.on_delete(&gone));
            }
        }
    }

    /// Deliver every cached object as an update to itself
    pub fn resync(&self) {
        let handlers = self.handlers();
        let objects = self.store.list();
        debug!("Resyncing {} {} objects", objects.len(), T::KIND);
        for obj in objects {
            handlers.iter().for_each(|h| h.on_update(&obj, &obj));
        }
    }
}

enum WatchEnd {
    Cancelled,
    Closed { delivered: usize },
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<T: Resource> Synced for Informer<T> {
    fn name(&self) -> String {
        T::KIND.to_string()
    }

    fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    fn synced_receiver(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }
}
