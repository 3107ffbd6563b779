//! Persistence boundary for origin and connection bookkeeping. Records are
//! keyed by id and support attach-style field updates, batch last-seen
//! writes, and range deletes by last-seen predicate.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One relay-server process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRecord {
    pub id: Uuid,
    pub startup_time: DateTime<Utc>,
    pub last_seen_time: DateTime<Utc>,
    pub shutdown_time: Option<DateTime<Utc>>,
}

/// One connector transport session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub tenant_name: String,
    pub origin_id: Uuid,
    pub remote_ip: Option<IpAddr>,
    pub connect_time: DateTime<Utc>,
    pub last_seen_time: DateTime<Utc>,
    pub disconnect_time: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    /// Live means no disconnect has been recorded yet.
    pub fn is_live(&self) -> bool {
        self.disconnect_time.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("statistics store error: {0}")]
    Store(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn insert_origin(&self, origin: OriginRecord) -> StoreResult<()>;

    /// Updates the origin's last-seen time. Unknown ids are ignored.
    async fn touch_origin(&self, origin_id: Uuid, seen_at: DateTime<Utc>) -> StoreResult<()>;

    /// Records the shutdown time, which also counts as activity.
    async fn shutdown_origin(&self, origin_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    /// Deletes origins not seen since the cutoff. Returns how many went.
    async fn delete_origins_seen_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn insert_connection(&self, connection: ConnectionRecord) -> StoreResult<()>;

    /// Applies many last-seen updates as one unit of work. Timestamps are
    /// idempotent values, so re-applying a batch is safe.
    async fn touch_connections(
        &self,
        batch: &HashMap<String, DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn disconnect_connection(&self, connection_id: &str, at: DateTime<Utc>)
        -> StoreResult<()>;

    /// Deletes connections whose last activity (last-seen or disconnect)
    /// predates the cutoff. Returns how many went.
    async fn delete_connections_inactive_before(&self, cutoff: DateTime<Utc>)
        -> StoreResult<u64>;

    /// All connection rows for a tenant (already-normalized name).
    async fn tenant_connections(&self, tenant_name: &str) -> StoreResult<Vec<ConnectionRecord>>;
}

/// In-memory store for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryStatisticsStore {
    origins: DashMap<Uuid, OriginRecord>,
    connections: DashMap<String, ConnectionRecord>,
}

impl MemoryStatisticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn origin(&self, id: &Uuid) -> Option<OriginRecord> {
        self.origins.get(id).map(|entry| entry.value().clone())
    }

    pub fn connection(&self, id: &str) -> Option<ConnectionRecord> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl StatisticsStore for MemoryStatisticsStore {
    async fn insert_origin(&self, origin: OriginRecord) -> StoreResult<()> {
        self.origins.insert(origin.id, origin);
        Ok(())
    }

    async fn touch_origin(&self, origin_id: Uuid, seen_at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(mut origin) = self.origins.get_mut(&origin_id) {
            // Last-seen never decreases, even when updates race.
            origin.last_seen_time = origin.last_seen_time.max(seen_at);
        }
        Ok(())
    }

    async fn shutdown_origin(&self, origin_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(mut origin) = self.origins.get_mut(&origin_id) {
            origin.shutdown_time = Some(at);
            origin.last_seen_time = origin.last_seen_time.max(at);
        }
        Ok(())
    }

    async fn delete_origins_seen_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let before = self.origins.len();
        self.origins.retain(|_, origin| origin.last_seen_time >= cutoff);
        Ok((before - self.origins.len()) as u64)
    }

    async fn insert_connection(&self, connection: ConnectionRecord) -> StoreResult<()> {
        self.connections.insert(connection.id.clone(), connection);
        Ok(())
    }

    async fn touch_connections(
        &self,
        batch: &HashMap<String, DateTime<Utc>>,
    ) -> StoreResult<()> {
        for (connection_id, seen_at) in batch {
            if let Some(mut connection) = self.connections.get_mut(connection_id) {
                connection.last_seen_time = connection.last_seen_time.max(*seen_at);
            }
        }
        Ok(())
    }

    async fn disconnect_connection(
        &self,
        connection_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(mut connection) = self.connections.get_mut(connection_id) {
            connection.disconnect_time = Some(at);
        }
        Ok(())
    }

    async fn delete_connections_inactive_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let before = self.connections.len();
        self.connections.retain(|_, connection| {
            let seen_expired = connection.last_seen_time < cutoff;
            let disconnect_expired = connection
                .disconnect_time
                .map(|at| at < cutoff)
                .unwrap_or(false);
            !(seen_expired || disconnect_expired)
        });
        Ok((before - self.connections.len()) as u64)
    }

    async fn tenant_connections(&self, tenant_name: &str) -> StoreResult<Vec<ConnectionRecord>> {
        Ok(self
            .connections
            .iter()
            .filter(|entry| entry.value().tenant_name == tenant_name)
            .map(|entry| entry.value().clone())
            .collect())
    }
}
