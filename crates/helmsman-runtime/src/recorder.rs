//! User-visible events about the objects controllers act on.
//!
//! Recording never blocks a reconcile: events go into a bounded channel
//! and a background sink writes them. Repeats of the same event on the
//! same object bump its count instead of creating a new Event.

use crate::api_client::ApiClient;
use helmsman_core::{Clock, Event, EventType, ObjectKey};
use helmsman_storage::DEFAULT_NAMESPACE;
use k8s_openapi::api::core::v1::{EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_QUEUE_CAPACITY: usize = 1000;
const MAX_AGGREGATE_ENTRIES: usize = 4096;

pub trait EventRecorder: Send + Sync {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub object: ObjectReference,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Recorder that writes Event objects through the API client
pub struct ApiEventRecorder {
    tx: mpsc::Sender<RecordedEvent>,
}

impl ApiEventRecorder {
    /// The returned sink must be run for events to be written
    pub fn new(client: ApiClient, component: impl Into<String>, clock: Arc<dyn Clock>) -> (Self, EventSink) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let sink = EventSink {
            client,
            component: component.into(),
            clock,
            rx,
            seen: HashMap::new(),
            seq: 0,
        };
        (Self { tx }, sink)
    }
}

impl EventRecorder for ApiEventRecorder {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        debug!(
            "Event({:?}/{:?}): {} {}: {}",
            object.namespace, object.name, event_type, reason, message
        );
        let record = RecordedEvent {
            object: object.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        };
        if let Err(e) = self.tx.try_send(record) {
            warn!("Dropping event {}: {}", reason, e);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AggregateKey {
    object: String,
    event_type: EventType,
    reason: String,
    message: String,
}

pub struct EventSink {
    client: ApiClient,
    component: String,
    clock: Arc<dyn Clock>,
    rx: mpsc::Receiver<RecordedEvent>,
    seen: HashMap<AggregateKey, ObjectKey>,
    seq: u64,
}

impl EventSink {
    pub async fn run(mut self, token: CancellationToken) {
        info!("Starting event sink for {}", self.component);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                record = self.rx.recv() => match record {
                    Some(record) => self.write(record).await,
                    None => break,
                },
            }
        }
        info!("Event sink for {} stopped", self.component);
    }

    async fn write(&mut self, record: RecordedEvent) {
        let key = AggregateKey {
            object: record
                .object
                .uid
                .clone()
                .unwrap_or_else(|| format!("{:?}/{:?}", record.object.namespace, record.object.name)),
            event_type: record.event_type,
            reason: record.reason.clone(),
            message: record.message.clone(),
        };
        let now = Time(self.clock.now());

        if let Some(existing) = self.seen.get(&key).cloned() {
            match self.client.get_opt::<Event>(&existing).await {
                Ok(Some(mut event)) => {
                    event.count = Some(event.count.unwrap_or(1) + 1);
                    event.last_timestamp = Some(now.clone());
                    match self.client.update(&event).await {
                        Ok(_) => return,
                        Err(e) => warn!("Failed to update event {}: {}", existing, e),
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to read event {}: {}", existing, e);
                    return;
                }
            }
        }

        let involved_name = record.object.name.clone().unwrap_or_default();
        let namespace = record
            .object
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let nanos = now.0.timestamp_nanos_opt().unwrap_or_default() as u64;
        self.seq += 1;
        let name = format!("{}.{:x}{:x}", involved_name, nanos, self.seq);

        let event = Event {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: record.object,
            reason: Some(record.reason),
            message: Some(record.message),
            type_: Some(record.event_type.to_string()),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            reporting_component: Some(self.component.clone()),
            ..Default::default()
        };

        match self.client.create(&event).await {
            Ok(_) => {
                if self.seen.len() >= MAX_AGGREGATE_ENTRIES {
                    self.seen.clear();
                }
                self.seen.insert(key, ObjectKey::new(namespace, name));
            }
            Err(e) => warn!("Failed to create event {}: {}", name, e),
        }
    }
}

/// In-memory recorder for tests
#[derive(Debug, Default)]
pub struct FakeRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }

    pub fn has(&self, reason: &str) -> bool {
        self.events.lock().iter().any(|e| e.reason == reason)
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventRecorder for FakeRecorder {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        self.events.lock().push(RecordedEvent {
            object: object.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_core::{Pod, Resource, SystemClock};
    use helmsman_storage::{ListOptions, RedbBackend, ResourceStore};

    fn pod_ref() -> ObjectReference {
        let mut pod = Pod::default();
        pod.metadata.name = Some("web-0".to_string());
        pod.metadata.namespace = Some("prod".to_string());
        pod.metadata.uid = Some("uid-1".to_string());
        pod.object_reference()
    }

    async fn wait_for_count(client: &ApiClient, count: i32) -> Vec<Event> {
        for _ in 0..200 {
            let events = client.list::<Event>(&ListOptions::default()).await.unwrap().items;
            if events.iter().map(|e| e.count.unwrap_or(0)).sum::<i32>() >= count {
                return events;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("events not written");
    }

    #[tokio::test]
    async fn test_repeated_events_are_aggregated() {
        let kv = Arc::new(RedbBackend::in_memory().unwrap());
        let backend = Arc::new(ResourceStore::new(kv, Arc::new(SystemClock)).unwrap());
        let client = ApiClient::new(backend);
        let (recorder, sink) = ApiEventRecorder::new(client.clone(), "test", Arc::new(SystemClock));
        let token = CancellationToken::new();
        let task = tokio::spawn(sink.run(token.clone()));

        recorder.event(&pod_ref(), EventType::Warning, "FailedCreate", "quota");
        recorder.event(&pod_ref(), EventType::Warning, "FailedCreate", "quota");
        recorder.event(&pod_ref(), EventType::Normal, "SuccessfulCreate", "ok");

        let events = wait_for_count(&client, 3).await;
        assert_eq!(events.len(), 2);
        let failed = events
            .iter()
            .find(|e| e.reason.as_deref() == Some("FailedCreate"))
            .unwrap();
        assert_eq!(failed.count, Some(2));
        assert_eq!(failed.metadata.namespace.as_deref(), Some("prod"));
        assert_eq!(failed.involved_object.uid.as_deref(), Some("uid-1"));

        token.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_fake_recorder() {
        let recorder = FakeRecorder::new();
        recorder.event(&pod_ref(), EventType::Warning, "InvalidOrdinal", "bad");
        assert!(recorder.has("InvalidOrdinal"));
        assert_eq!(recorder.reasons(), vec!["InvalidOrdinal"]);
        recorder.clear();
        assert!(recorder.events().is_empty());
    }
}
