use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::trace;

use crate::{SignalStore, StoreError};

/// Redis-backed signaling store.
///
/// Every key is written with a TTL so sessions abandoned mid-negotiation
/// age out of the backend instead of accumulating forever.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisStore {
    pub async fn new(redis_url: &str, ttl_seconds: u64) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self { conn, ttl_seconds })
    }
}

#[async_trait]
impl SignalStore for RedisStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        trace!(target: "signal_store", %key, len = value.len(), "redis put");
        conn.set_ex::<_, _, ()>(key, value, self.ttl_seconds)
            .await
            .map_err(backend)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(backend)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        trace!(target: "signal_store", %key, "redis delete");
        conn.del::<_, ()>(key).await.map_err(backend)
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}
