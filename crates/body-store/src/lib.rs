//! Temporary out-of-band storage for request and response bodies that are
//! too large to travel inline in a relay envelope. Bodies are addressed by
//! an opaque handle that is safe to embed in an envelope.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BodyStoreError {
    #[error("body {0} not found")]
    NotFound(String),
    #[error("body store backend error: {0}")]
    Backend(String),
}

pub type BodyStoreResult<T> = Result<T, BodyStoreError>;

#[async_trait]
pub trait BodyStore: Send + Sync {
    /// Stores a body and returns its opaque handle.
    async fn put(&self, body: Bytes) -> BodyStoreResult<String>;

    /// Fetches a stored body. Fails with [`BodyStoreError::NotFound`] when
    /// the handle is unknown or already expired.
    async fn get(&self, handle: &str) -> BodyStoreResult<Bytes>;

    /// Removes a stored body. Deleting an unknown handle is a no-op so
    /// cleanup paths can run unconditionally.
    async fn delete(&self, handle: &str) -> BodyStoreResult<()>;
}

fn new_handle() -> String {
    Uuid::new_v4().to_string()
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryBodyStore {
    entries: DashMap<String, Bytes>,
}

impl MemoryBodyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bodies currently held. Lets tests assert nothing leaked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl BodyStore for MemoryBodyStore {
    async fn put(&self, body: Bytes) -> BodyStoreResult<String> {
        let handle = new_handle();
        self.entries.insert(handle.clone(), body);
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> BodyStoreResult<Bytes> {
        self.entries
            .get(handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BodyStoreError::NotFound(handle.to_string()))
    }

    async fn delete(&self, handle: &str) -> BodyStoreResult<()> {
        self.entries.remove(handle);
        Ok(())
    }
}

/// Redis-backed store. Every body carries a TTL so a handle orphaned by a
/// crashed relay attempt expires on its own.
#[derive(Clone)]
pub struct RedisBodyStore {
    redis: redis::aio::ConnectionManager,
    ttl_seconds: u64,
}

impl RedisBodyStore {
    pub async fn new(redis_url: &str, ttl_seconds: u64) -> BodyStoreResult<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| BodyStoreError::Backend(e.to_string()))?;
        let redis = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| BodyStoreError::Backend(e.to_string()))?;
        Ok(Self { redis, ttl_seconds })
    }

    fn key(handle: &str) -> String {
        format!("body:{}", handle)
    }
}

#[async_trait]
impl BodyStore for RedisBodyStore {
    async fn put(&self, body: Bytes) -> BodyStoreResult<String> {
        use redis::AsyncCommands;

        let handle = new_handle();
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(Self::key(&handle), body.as_ref(), self.ttl_seconds)
            .await
            .map_err(|e| BodyStoreError::Backend(e.to_string()))?;
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> BodyStoreResult<Bytes> {
        use redis::AsyncCommands;

        let mut conn = self.redis.clone();
        let value: Option<Vec<u8>> = conn
            .get(Self::key(handle))
            .await
            .map_err(|e| BodyStoreError::Backend(e.to_string()))?;
        value
            .map(Bytes::from)
            .ok_or_else(|| BodyStoreError::NotFound(handle.to_string()))
    }

    async fn delete(&self, handle: &str) -> BodyStoreResult<()> {
        use redis::AsyncCommands;

        let mut conn = self.redis.clone();
        conn.del::<_, ()>(Self::key(handle))
            .await
            .map_err(|e| BodyStoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = MemoryBodyStore::new();
        let handle = store.put(Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(store.get(&handle).await.unwrap(), Bytes::from_static(b"payload"));
        store.delete(&handle).await.unwrap();
        assert!(matches!(
            store.get(&handle).await,
            Err(BodyStoreError::NotFound(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_handle_is_noop() {
        let store = MemoryBodyStore::new();
        store.delete("no-such-handle").await.unwrap();
    }

    #[tokio::test]
    async fn handles_are_unique() {
        let store = MemoryBodyStore::new();
        let a = store.put(Bytes::from_static(b"a")).await.unwrap();
        let b = store.put(Bytes::from_static(b"a")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }
}
