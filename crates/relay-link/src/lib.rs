//! Transport seam between the relay server and connectors. The physical
//! hub connection (authentication, token refresh, reconnect) lives outside
//! this workspace; the core only needs topic-addressed envelope delivery.
//! Serialization and wire framing belong to the concrete transport, so
//! both ends of the relay deal in [`Envelope`]s directly.

use std::collections::HashMap;

use parking_lot::RwLock;
use relay_proto::Envelope;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no subscriber listening on topic {0:?}")]
    NoSubscriber(String),
    #[error("link transport error: {0}")]
    Transport(String),
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Topic carrying requests for one tenant's connectors.
pub fn requests_topic(tenant: &str) -> String {
    format!("tenant/{}/requests", tenant)
}

/// Topic carrying acknowledgements and responses back to the server.
pub const RESPONSES_TOPIC: &str = "responses";

// A request topic serves one tenant; the responses topic funnels every
// tenant's answers back to the server and needs more headroom.
const REQUEST_TOPIC_CAPACITY: usize = 64;
const RESPONSES_TOPIC_CAPACITY: usize = 1024;

fn capacity_for(topic: &str) -> usize {
    if topic == RESPONSES_TOPIC {
        RESPONSES_TOPIC_CAPACITY
    } else {
        REQUEST_TOPIC_CAPACITY
    }
}

pub trait TunnelLink: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope>;
    fn publish(&self, topic: &str, envelope: Envelope) -> LinkResult<()>;
}

/// In-memory link for tests and single-process deployments where the
/// connector runtime is embedded next to the server.
#[derive(Debug, Default)]
pub struct InProcessLink {
    topics: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl InProcessLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Envelope> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(capacity_for(topic)).0)
            .clone()
    }
}

impl TunnelLink for InProcessLink {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, envelope: Envelope) -> LinkResult<()> {
        self.sender_for(topic)
            .send(envelope)
            .map(|_| ())
            .map_err(|_| LinkError::NoSubscriber(topic.to_string()))
    }
}
