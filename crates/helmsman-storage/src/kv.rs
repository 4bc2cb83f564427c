use crate::Result;
use bytes::Bytes;

/// Ordered key-value store
pub trait KVStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    fn exists(&self, key: &[u8]) -> Result<bool>;

    /// Begin a write transaction; dropping it without commit rolls back
    fn transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// Transaction trait for atomic multi-key writes
pub trait Transaction: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, key: &[u8]) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}
