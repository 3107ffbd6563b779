//! Shared wire definitions for server ↔ connector relay traffic.
//! Keeping these in a dedicated crate lets the server, the connector
//! runtime, and any future transport host agree on the envelope shape
//! without pulling in heavier runtime code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Synthesized status codes used when the relay pipeline has to answer
/// on behalf of a target.
pub mod status {
    /// No connector is connected for the requested tenant.
    pub const NO_CONNECTOR_AVAILABLE: u16 = 503;
    /// The connector has no target registered under the routing key.
    pub const TARGET_NOT_FOUND: u16 = 502;
    /// The target was invoked but failed.
    pub const TARGET_INVOCATION_FAILED: u16 = 502;
    /// An outsourced request body could not be fetched from the body store.
    pub const BODY_UNAVAILABLE: u16 = 502;
    /// The target did not answer within the per-target deadline.
    pub const TARGET_TIMEOUT: u16 = 504;
    /// The server-side overall relay wait expired.
    pub const DISPATCH_TIMEOUT: u16 = 504;
    /// The response body could not be persisted to the body store.
    pub const OUTSOURCING_FAILED: u16 = 500;
}

/// Reference to a request or response body: small bodies travel inside
/// the envelope, large ones live in the body store and travel by handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BodyRef {
    Inline { bytes: Vec<u8> },
    Outsourced { handle: String, length: u64 },
}

impl BodyRef {
    pub fn empty() -> Self {
        BodyRef::Inline { bytes: Vec::new() }
    }

    /// Declared body length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            BodyRef::Inline { bytes } => bytes.len() as u64,
            BodyRef::Outsourced { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, BodyRef::Inline { .. })
    }
}

/// Whether the connector must confirm receipt of a request before it
/// starts working on it. An acknowledge lets the dispatching side retire
/// retry state without waiting for the full response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgeMode {
    Disabled,
    ConnectorReceived,
}

/// One relayed HTTP call, as sent from the server to a connector.
/// Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub request_id: Uuid,
    pub tenant: String,
    /// Routing key resolved against the connector's target registry.
    pub target: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Ordered multi-map; duplicate names are preserved.
    pub headers: Vec<(String, String)>,
    pub body: BodyRef,
    pub acknowledge_mode: AcknowledgeMode,
}

/// The answer produced for one [`ClientRequest`]. `request_id` must match
/// the originating request. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetResponse {
    pub request_id: Uuid,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: BodyRef,
    pub request_start: Option<DateTime<Utc>>,
    pub request_duration_ms: Option<u64>,
}

impl TargetResponse {
    /// A headerless, bodyless response for error and short-circuit paths.
    pub fn synthesized(request_id: Uuid, status: u16) -> Self {
        Self {
            request_id,
            status,
            headers: Vec::new(),
            body: BodyRef::empty(),
            request_start: None,
            request_duration_ms: None,
        }
    }
}

/// A frame on the tunnel link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Request(ClientRequest),
    Acknowledge { request_id: Uuid },
    Response(TargetResponse),
}

impl Envelope {
    pub fn request_id(&self) -> Uuid {
        match self {
            Envelope::Request(request) => request.request_id,
            Envelope::Acknowledge { request_id } => *request_id,
            Envelope::Response(response) => response.request_id,
        }
    }
}

/// Body placement policy: bodies at or above the threshold are outsourced,
/// everything below stays inline.
pub fn should_outsource(length: u64, threshold: u64) -> bool {
    length >= threshold
}
