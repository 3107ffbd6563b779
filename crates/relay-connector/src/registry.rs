//! In-memory mapping from routing key to a callable local target.
//! Registered by integrations when they start listening for a key,
//! removed on shutdown; read on every relayed request.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Request metadata and body handed to a target.
#[derive(Debug, Clone)]
pub struct TargetRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// What a target hands back to the worker.
#[derive(Debug, Clone)]
pub struct TargetReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A locally reachable handler registered under a routing key. Variants
/// are supplied by whichever integration registers them.
#[async_trait]
pub trait RelayTarget: Send + Sync {
    async fn invoke(&self, request: TargetRequest) -> anyhow::Result<TargetReply>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("target key {0:?} is already registered")]
    DuplicateKey(String),
}

/// Proof of one registration. Unregistering through a stale handle (the
/// key was since removed and re-registered) is a no-op.
#[derive(Debug, Clone)]
pub struct RegistrationHandle {
    key: String,
    registration_id: Uuid,
}

impl RegistrationHandle {
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct Registration {
    id: Uuid,
    target: Arc<dyn RelayTarget>,
}

/// Concurrent key → target mapping. Lookups never wait on registration
/// churn beyond the map's own sharded critical section.
#[derive(Default)]
pub struct TargetRegistry {
    entries: DashMap<String, Registration>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key` to `target`. A key that is already bound is rejected
    /// rather than silently replaced, so traffic intended for the prior
    /// handler is never orphaned.
    pub fn register(
        &self,
        key: impl Into<String>,
        target: Arc<dyn RelayTarget>,
    ) -> Result<RegistrationHandle, RegistryError> {
        let key = key.into();
        match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(target_key = %key, "rejected duplicate target registration");
                Err(RegistryError::DuplicateKey(key))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let id = Uuid::new_v4();
                entry.insert(Registration { id, target });
                debug!(target_key = %key, registration_id = %id, "registered target");
                Ok(RegistrationHandle {
                    key,
                    registration_id: id,
                })
            }
        }
    }

    /// Removes the mapping the handle was issued for. Idempotent: a handle
    /// whose entry is already gone, or was replaced by a newer
    /// registration, does nothing.
    pub fn unregister(&self, handle: &RegistrationHandle) {
        let removed = self
            .entries
            .remove_if(&handle.key, |_, registration| {
                registration.id == handle.registration_id
            })
            .is_some();
        if removed {
            debug!(target_key = %handle.key, "unregistered target");
        } else {
            debug!(target_key = %handle.key, "unregister skipped; registration already gone");
        }
    }

    /// Routing-key lookup; `None` when no target is listening.
    pub fn resolve(&self, key: &str) -> Option<Arc<dyn RelayTarget>> {
        self.entries
            .get(key)
            .map(|entry| Arc::clone(&entry.value().target))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
