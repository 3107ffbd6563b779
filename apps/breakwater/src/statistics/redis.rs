//! Redis-backed statistics store. Each record lives in its own hash so
//! scalar fields (last-seen, disconnect) can be written without reading
//! the record back first; a per-tenant index set makes the availability
//! lookup cheap.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use uuid::Uuid;

use super::store::{ConnectionRecord, OriginRecord, StatisticsStore, StoreError, StoreResult};

const ORIGIN_PREFIX: &str = "origin:";
const CONNECTION_PREFIX: &str = "connection:";

fn origin_key(id: Uuid) -> String {
    format!("{}{}", ORIGIN_PREFIX, id)
}

fn connection_key(id: &str) -> String {
    format!("{}{}", CONNECTION_PREFIX, id)
}

fn tenant_index_key(tenant_name: &str) -> String {
    format!("tenant:{}:connections", tenant_name)
}

fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn decode_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Store(format!("invalid timestamp {raw:?}: {e}")))
}

fn store_err(e: redis::RedisError) -> StoreError {
    StoreError::Store(e.to_string())
}

#[derive(Clone)]
pub struct RedisStatisticsStore {
    redis: redis::aio::ConnectionManager,
}

impl RedisStatisticsStore {
    pub async fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url).map_err(store_err)?;
        let redis = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(store_err)?;
        Ok(Self { redis })
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next_cursor, chunk): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            cursor = next_cursor;
            keys.extend(chunk);
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn read_connection(&self, connection_id: &str) -> StoreResult<Option<ConnectionRecord>> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(connection_key(connection_id))
            .await
            .map_err(store_err)?;
        if fields.is_empty() {
            return Ok(None);
        }

        let get = |name: &str| -> StoreResult<&String> {
            fields
                .get(name)
                .ok_or_else(|| StoreError::Store(format!("connection field {name} missing")))
        };

        Ok(Some(ConnectionRecord {
            id: connection_id.to_string(),
            tenant_name: get("tenant_name")?.clone(),
            origin_id: Uuid::parse_str(get("origin_id")?)
                .map_err(|e| StoreError::Store(e.to_string()))?,
            remote_ip: fields.get("remote_ip").and_then(|ip| ip.parse().ok()),
            connect_time: decode_time(get("connect_time")?)?,
            last_seen_time: decode_time(get("last_seen_time")?)?,
            disconnect_time: fields
                .get("disconnect_time")
                .map(|raw| decode_time(raw))
                .transpose()?,
        }))
    }
}

#[async_trait]
impl StatisticsStore for RedisStatisticsStore {
    async fn insert_origin(&self, origin: OriginRecord) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("HSET")
            .arg(origin_key(origin.id))
            .arg("startup_time")
            .arg(encode_time(origin.startup_time))
            .arg("last_seen_time")
            .arg(encode_time(origin.last_seen_time))
            .ignore();
        if let Some(shutdown) = origin.shutdown_time {
            pipe.cmd("HSET")
                .arg(origin_key(origin.id))
                .arg("shutdown_time")
                .arg(encode_time(shutdown))
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(store_err)
    }

    async fn touch_origin(&self, origin_id: Uuid, seen_at: DateTime<Utc>) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let key = origin_key(origin_id);
        let exists: bool = conn.exists(&key).await.map_err(store_err)?;
        if !exists {
            return Ok(());
        }
        conn.hset::<_, _, _, ()>(key, "last_seen_time", encode_time(seen_at))
            .await
            .map_err(store_err)
    }

    async fn shutdown_origin(&self, origin_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let key = origin_key(origin_id);
        let exists: bool = conn.exists(&key).await.map_err(store_err)?;
        if !exists {
            return Ok(());
        }
        redis::pipe()
            .cmd("HSET")
            .arg(&key)
            .arg("shutdown_time")
            .arg(encode_time(at))
            .arg("last_seen_time")
            .arg(encode_time(at))
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn delete_origins_seen_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut conn = self.redis.clone();
        let mut removed = 0u64;
        for key in self.scan_keys(&format!("{}*", ORIGIN_PREFIX)).await? {
            let last_seen: Option<String> =
                conn.hget(&key, "last_seen_time").await.map_err(store_err)?;
            let Some(last_seen) = last_seen else { continue };
            if decode_time(&last_seen)? < cutoff {
                conn.del::<_, ()>(&key).await.map_err(store_err)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn insert_connection(&self, connection: ConnectionRecord) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let key = connection_key(&connection.id);
        let mut pipe = redis::pipe();
        pipe.cmd("HSET")
            .arg(&key)
            .arg("tenant_name")
            .arg(&connection.tenant_name)
            .arg("origin_id")
            .arg(connection.origin_id.to_string())
            .arg("connect_time")
            .arg(encode_time(connection.connect_time))
            .arg("last_seen_time")
            .arg(encode_time(connection.last_seen_time))
            .ignore();
        if let Some(ip) = connection.remote_ip {
            pipe.cmd("HSET")
                .arg(&key)
                .arg("remote_ip")
                .arg(ip.to_string())
                .ignore();
        }
        pipe.cmd("SADD")
            .arg(tenant_index_key(&connection.tenant_name))
            .arg(&connection.id)
            .ignore();
        pipe.query_async::<()>(&mut conn).await.map_err(store_err)
    }

    async fn touch_connections(
        &self,
        batch: &HashMap<String, DateTime<Utc>>,
    ) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        // MULTI/EXEC: the batch applies in full or not at all.
        pipe.atomic();
        for (connection_id, seen_at) in batch {
            pipe.cmd("HSET")
                .arg(connection_key(connection_id))
                .arg("last_seen_time")
                .arg(encode_time(*seen_at))
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(store_err)
    }

    async fn disconnect_connection(
        &self,
        connection_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let key = connection_key(connection_id);
        let exists: bool = conn.exists(&key).await.map_err(store_err)?;
        if !exists {
            return Ok(());
        }
        conn.hset::<_, _, _, ()>(key, "disconnect_time", encode_time(at))
            .await
            .map_err(store_err)
    }

    async fn delete_connections_inactive_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut conn = self.redis.clone();
        let mut removed = 0u64;
        for key in self.scan_keys(&format!("{}*", CONNECTION_PREFIX)).await? {
            let connection_id = key.trim_start_matches(CONNECTION_PREFIX).to_string();
            let Some(record) = self.read_connection(&connection_id).await? else {
                continue;
            };
            let seen_expired = record.last_seen_time < cutoff;
            let disconnect_expired = record
                .disconnect_time
                .map(|at| at < cutoff)
                .unwrap_or(false);
            if seen_expired || disconnect_expired {
                redis::pipe()
                    .cmd("DEL")
                    .arg(&key)
                    .ignore()
                    .cmd("SREM")
                    .arg(tenant_index_key(&record.tenant_name))
                    .arg(&connection_id)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(store_err)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn tenant_connections(&self, tenant_name: &str) -> StoreResult<Vec<ConnectionRecord>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .smembers(tenant_index_key(tenant_name))
            .await
            .map_err(store_err)?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.read_connection(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
