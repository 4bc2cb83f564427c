//! Helmsman Storage - revisioned object storage
//!
//! This crate provides:
//! - KVStore trait for ordered key-value storage
//! - redb-based implementation (on disk or in memory)
//! - Key encoding
//! - ResourceStore, the watchable object store the controllers talk to

pub mod encoding;
pub mod error;
pub mod kv;
pub mod redb_backend;
pub mod resource_store;
pub mod watchable;

// Re-export commonly used types
pub use encoding::KeyEncoder;
pub use error::{Result, StorageError};
pub use kv::{KVStore, Transaction};
pub use redb_backend::RedbBackend;
pub use resource_store::{ResourceStore, ResourceStoreConfig, DEFAULT_NAMESPACE, FINALIZER_FOREGROUND};
pub use watchable::{
    DeleteOptions, DeleteOutcome, ListOptions, ListResult, Preconditions, PropagationPolicy,
    WatchStream, WatchableKV,
};
