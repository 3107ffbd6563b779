//! Connection and origin bookkeeping. Writes are best-effort: a failing
//! store degrades observability, never request relay, so every operation
//! here logs and swallows store errors. High-frequency heartbeats are
//! coalesced by [`HeartbeatBatcher`] into one batched write per flush
//! interval.

pub mod redis;
pub mod store;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use store::{ConnectionRecord, OriginRecord, StatisticsStore};

/// Canonical tenant casing used for every write and lookup.
pub fn normalize_tenant(tenant_name: &str) -> String {
    tenant_name.trim().to_ascii_lowercase()
}

#[derive(Clone)]
pub struct StatisticsTracker {
    store: Arc<dyn StatisticsStore>,
    availability_window: Duration,
}

impl StatisticsTracker {
    pub fn new(store: Arc<dyn StatisticsStore>, availability_window: Duration) -> Self {
        Self {
            store,
            availability_window,
        }
    }

    pub async fn record_origin_startup(&self, origin_id: Uuid) {
        debug!(%origin_id, "adding origin to statistics tracking");
        let startup = Utc::now();
        let result = self
            .store
            .insert_origin(OriginRecord {
                id: origin_id,
                startup_time: startup,
                last_seen_time: startup,
                shutdown_time: None,
            })
            .await;
        if let Err(err) = result {
            error!(%origin_id, %err, "failed to create origin record");
        }
    }

    pub async fn touch_origin(&self, origin_id: Uuid) {
        debug!(%origin_id, "updating origin last seen time");
        if let Err(err) = self.store.touch_origin(origin_id, Utc::now()).await {
            error!(%origin_id, %err, "failed to update origin record");
        }
    }

    pub async fn record_origin_shutdown(&self, origin_id: Uuid) {
        debug!(%origin_id, "setting origin shutdown time");
        if let Err(err) = self.store.shutdown_origin(origin_id, Utc::now()).await {
            error!(%origin_id, %err, "failed to record origin shutdown");
        }
    }

    pub async fn prune_origins(&self, max_age: Duration) {
        let cutoff = Utc::now() - max_age;
        debug!(%cutoff, "pruning origins not seen since cutoff");
        match self.store.delete_origins_seen_before(cutoff).await {
            Ok(removed) if removed > 0 => debug!(removed, "pruned stale origins"),
            Ok(_) => {}
            Err(err) => error!(%err, "failed to prune origins"),
        }
    }

    pub async fn record_connect(
        &self,
        connection_id: &str,
        tenant_name: &str,
        origin_id: Uuid,
        remote_ip: Option<IpAddr>,
    ) {
        debug!(%connection_id, %tenant_name, "adding connection to statistics tracking");
        let now = Utc::now();
        let result = self
            .store
            .insert_connection(ConnectionRecord {
                id: connection_id.to_string(),
                tenant_name: normalize_tenant(tenant_name),
                origin_id,
                remote_ip,
                connect_time: now,
                last_seen_time: now,
                disconnect_time: None,
            })
            .await;
        if let Err(err) = result {
            error!(%connection_id, %err, "failed to create connection record");
        }
    }

    pub async fn record_disconnect(&self, connection_id: &str) {
        debug!(%connection_id, "setting connection disconnect time");
        if let Err(err) = self
            .store
            .disconnect_connection(connection_id, Utc::now())
            .await
        {
            error!(%connection_id, %err, "failed to record disconnect");
        }
    }

    /// Applies a batch of last-seen updates as one unit of work, tagged
    /// with a generated batch id for traceability.
    pub async fn touch_connections(&self, batch: &HashMap<String, DateTime<Utc>>) {
        if batch.is_empty() {
            return;
        }
        let batch_id = Uuid::new_v4();
        debug!(
            %batch_id,
            update_count = batch.len(),
            "updating last seen time of connections"
        );
        if let Err(err) = self.store.touch_connections(batch).await {
            error!(%batch_id, %err, "failed to apply connection last-seen batch");
        }
    }

    pub async fn prune_connections(&self, max_age: Duration) {
        let cutoff = Utc::now() - max_age;
        debug!(%cutoff, "pruning connections inactive since cutoff");
        match self.store.delete_connections_inactive_before(cutoff).await {
            Ok(removed) if removed > 0 => debug!(removed, "pruned stale connections"),
            Ok(_) => {}
            Err(err) => error!(%err, "failed to prune connections"),
        }
    }

    /// True iff at least one connection for the tenant is live (no
    /// disconnect recorded) and was seen within the availability window.
    /// Store failures report the tenant unavailable, which is the safe
    /// direction: the caller gets the defined "no target" response.
    pub async fn is_tenant_available(&self, tenant_name: &str) -> bool {
        let tenant = normalize_tenant(tenant_name);
        let connections = match self.store.tenant_connections(&tenant).await {
            Ok(connections) => connections,
            Err(err) => {
                error!(%tenant, %err, "availability lookup failed; reporting unavailable");
                return false;
            }
        };

        let freshness_cutoff = Utc::now()
            - chrono::Duration::from_std(self.availability_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(120));
        connections
            .iter()
            .any(|connection| connection.is_live() && connection.last_seen_time >= freshness_cutoff)
    }
}

/// Collects per-connection heartbeats and flushes them as one batched
/// write per interval, so many connectors do not translate into one store
/// write per heartbeat.
pub struct HeartbeatBatcher {
    pending: Arc<DashMap<String, DateTime<Utc>>>,
    tracker: StatisticsTracker,
}

impl HeartbeatBatcher {
    pub fn new(tracker: StatisticsTracker) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            tracker,
        }
    }

    /// Cheap; called on every inbound activity including pure heartbeats.
    pub fn record(&self, connection_id: &str) {
        self.pending.insert(connection_id.to_string(), Utc::now());
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drains the pending updates into one batched store write.
    pub async fn flush(&self) {
        let keys: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        if keys.is_empty() {
            return;
        }
        let mut batch = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some((connection_id, seen_at)) = self.pending.remove(&key) {
                batch.insert(connection_id, seen_at);
            }
        }
        self.tracker.touch_connections(&batch).await;
    }

    pub fn spawn_flusher(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let mut ticker = tokio::time::interval(interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                self.flush().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::store::MemoryStatisticsStore;
    use super::*;

    fn tracker_with_store() -> (StatisticsTracker, Arc<MemoryStatisticsStore>) {
        let store = Arc::new(MemoryStatisticsStore::new());
        (
            StatisticsTracker::new(store.clone(), Duration::from_secs(120)),
            store,
        )
    }

    #[tokio::test]
    async fn tenant_becomes_available_on_connect_and_unavailable_on_disconnect() {
        let (tracker, _store) = tracker_with_store();
        let origin_id = Uuid::new_v4();

        assert!(!tracker.is_tenant_available("acme").await);

        tracker.record_connect("c1", "acme", origin_id, None).await;
        assert!(tracker.is_tenant_available("acme").await);

        tracker.record_disconnect("c1").await;
        assert!(!tracker.is_tenant_available("acme").await);
    }

    #[tokio::test]
    async fn tenant_names_are_normalized() {
        let (tracker, store) = tracker_with_store();
        tracker
            .record_connect("c1", "  ACME ", Uuid::new_v4(), None)
            .await;

        assert_eq!(store.connection("c1").unwrap().tenant_name, "acme");
        assert!(tracker.is_tenant_available("Acme").await);
        assert!(tracker.is_tenant_available("acme").await);
    }

    #[tokio::test]
    async fn stale_connections_do_not_count_as_available() {
        let store = Arc::new(MemoryStatisticsStore::new());
        let tracker = StatisticsTracker::new(store.clone(), Duration::from_secs(0));

        tracker.record_connect("c1", "acme", Uuid::new_v4(), None).await;
        // Window of zero: even a fresh row is already outside it.
        assert!(!tracker.is_tenant_available("acme").await);
    }

    #[tokio::test]
    async fn batcher_coalesces_heartbeats_into_one_batch() {
        let (tracker, store) = tracker_with_store();
        tracker.record_connect("c1", "acme", Uuid::new_v4(), None).await;
        tracker.record_connect("c2", "acme", Uuid::new_v4(), None).await;
        let before_c1 = store.connection("c1").unwrap().last_seen_time;

        let batcher = HeartbeatBatcher::new(tracker);
        batcher.record("c1");
        batcher.record("c1"); // replaced, not queued twice
        batcher.record("c2");
        assert_eq!(batcher.pending_len(), 2);

        batcher.flush().await;
        assert_eq!(batcher.pending_len(), 0);
        assert!(store.connection("c1").unwrap().last_seen_time >= before_c1);

        // Nothing pending: flush is a no-op.
        batcher.flush().await;
    }

    #[tokio::test]
    async fn origin_lifecycle_is_recorded() {
        let (tracker, store) = tracker_with_store();
        let origin_id = Uuid::new_v4();

        tracker.record_origin_startup(origin_id).await;
        let created = store.origin(&origin_id).unwrap();
        assert!(created.shutdown_time.is_none());
        assert!(created.last_seen_time >= created.startup_time);

        tracker.touch_origin(origin_id).await;
        tracker.record_origin_shutdown(origin_id).await;
        let finished = store.origin(&origin_id).unwrap();
        assert!(finished.shutdown_time.is_some());
        assert!(finished.last_seen_time >= finished.startup_time);
    }
}
