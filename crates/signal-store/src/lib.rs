//! Key-value signaling channel abstraction.
//!
//! Session negotiation runs over a shared, eventually-visible store with
//! nothing but `put`/`get`/`delete`: no transactions, no ordering across
//! keys, no delivery notification. Consumers poll. The protocol layer is
//! written against [`SignalStore`] so it can run over an in-process map in
//! tests and a real backend in production.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;

#[cfg(feature = "redis-store")]
mod redis_store;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("signaling store backend error: {0}")]
    Backend(String),
}

/// Shared key-value channel used to carry signaling messages.
///
/// Implementations provide at-least-once visibility at best: a written value
/// may be observed multiple times by a polling reader, and concurrent writes
/// to the same key resolve last-writer-wins. Callers must tolerate both.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process store for tests and single-host demos.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        trace!(target: "signal_store", %key, len = value.len(), "put");
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        trace!(target: "signal_store", %key, "delete");
        self.entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips_values() {
        let store = MemoryStore::new();
        store.put("session:abcde:offer", "payload").await.unwrap();
        assert_eq!(
            store.get("session:abcde:offer").await.unwrap().as_deref(),
            Some("payload")
        );

        store.delete("session:abcde:offer").await.unwrap();
        assert_eq!(store.get("session:abcde:offer").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_overwrites_last_writer_wins() {
        let store = MemoryStore::new();
        store.put("k", "first").await.unwrap();
        store.put("k", "second").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("second"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_key_reads_as_absent() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
        // Deleting an absent key is a no-op, not an error.
        store.delete("nope").await.unwrap();
    }
}
