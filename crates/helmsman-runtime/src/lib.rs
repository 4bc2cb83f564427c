// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

//! Helmsman Runtime - the substrate every controller runs on
//!
//! - [`WorkQueue`]: deduplicating, single-flight, delayed and rate-limited keys
//! - [`Informer`] and [`Store`]: list+watch caches with secondary indexes
//! - [`Controller`]: the worker loop that drives a [`Reconciler`]
//! - [`EventRecorder`]: user-visible events with aggregation

pub mod api_client;
pub mod error;
pub mod informer;
pub mod rate_limiter;
pub mod reconciler;
pub mod recorder;
pub mod store;
pub mod workqueue;

pub use api_client::{ApiClient, ObjectList, WatchEvent};
pub use error::{Result, RuntimeError};
pub use informer::{EventHandler, EventHandlerFns, Informer, InformerConfig, Synced};
pub use rate_limiter::{
    default_controller_rate_limiter, Backoff, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter, TokenBucket,
};
pub use reconciler::{
    wait_for_cache_sync, Action, Classify, Controller, ControllerConfig, ErrorClass, Reconciler,
};
pub use recorder::{ApiEventRecorder, EventRecorder, EventSink, FakeRecorder, RecordedEvent};
pub use store::{
    index_by_controller_uid, index_by_namespace, index_pods_by_node, IndexFn, Store,
    INDEX_CONTROLLER_UID, INDEX_NAMESPACE, INDEX_NODE_NAME,
};
pub use workqueue::{QueueMetrics, WorkQueue};

// Re-exported so controllers depend on one cancellation type
pub use tokio_util::sync::CancellationToken;
