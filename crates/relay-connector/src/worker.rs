//! Connector-side request processing: turns one inbound relay request into
//! a local target call and produces the response envelope, deciding for
//! both directions whether the body travels inline or through the body
//! store. Every failure is converted into a status-coded response so the
//! original caller always gets an answer.

use std::sync::Arc;
use std::time::Duration;

use body_store::BodyStore;
use bytes::Bytes;
use chrono::Utc;
use relay_proto::{status, BodyRef, ClientRequest, TargetResponse};
use tracing::{debug, error, warn};

use crate::registry::{TargetReply, TargetRequest, TargetRegistry};

/// Largest response body still delivered inline when the body store
/// rejects a put. Anything bigger is reported undeliverable instead of
/// flooding the link.
const INLINE_FALLBACK_LIMIT_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Deadline for one target invocation.
    pub target_timeout: Duration,
    /// Bodies at or above this many bytes are outsourced to the body store.
    pub inline_body_threshold: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            target_timeout: Duration::from_secs(30),
            inline_body_threshold: 64 * 1024,
        }
    }
}

pub struct RequestWorker {
    registry: Arc<TargetRegistry>,
    body_store: Arc<dyn BodyStore>,
    config: WorkerConfig,
}

impl RequestWorker {
    pub fn new(
        registry: Arc<TargetRegistry>,
        body_store: Arc<dyn BodyStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            body_store,
            config,
        }
    }

    /// Processes one relayed request end to end. Infallible by contract:
    /// target and body failures come back as synthesized responses carrying
    /// the originating request id.
    pub async fn handle(&self, request: ClientRequest) -> TargetResponse {
        let request_id = request.request_id;

        let Some(target) = self.registry.resolve(&request.target) else {
            debug!(%request_id, target_key = %request.target, "no target registered for key");
            return TargetResponse::synthesized(request_id, status::TARGET_NOT_FOUND);
        };

        let body = match self.acquire_body(&request).await {
            Ok(body) => body,
            Err(handle) => {
                warn!(
                    %request_id,
                    %handle,
                    error_kind = "BodyUnavailable",
                    "outsourced request body could not be fetched"
                );
                return TargetResponse::synthesized(request_id, status::BODY_UNAVAILABLE);
            }
        };

        let target_request = TargetRequest {
            method: request.method.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            headers: request.headers.clone(),
            body,
        };

        let request_start = Utc::now();
        let outcome =
            tokio::time::timeout(self.config.target_timeout, target.invoke(target_request)).await;
        let duration_ms = (Utc::now() - request_start)
            .num_milliseconds()
            .max(0) as u64;

        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => {
                warn!(
                    %request_id,
                    target_key = %request.target,
                    error_kind = "TargetInvocationFailed",
                    %error,
                    "target invocation failed"
                );
                return TargetResponse::synthesized(request_id, status::TARGET_INVOCATION_FAILED);
            }
            Err(_) => {
                warn!(
                    %request_id,
                    target_key = %request.target,
                    error_kind = "TargetTimeout",
                    timeout_ms = self.config.target_timeout.as_millis() as u64,
                    "target did not answer within its deadline"
                );
                return TargetResponse::synthesized(request_id, status::TARGET_TIMEOUT);
            }
        };

        let mut response = self.place_response_body(request_id, reply).await;
        response.request_start = Some(request_start);
        response.request_duration_ms = Some(duration_ms);
        response
    }

    /// Materializes the request body: inline bytes are used directly,
    /// outsourced bodies are fetched from the store. On fetch failure the
    /// offending handle is returned for logging.
    async fn acquire_body(&self, request: &ClientRequest) -> Result<Bytes, String> {
        match &request.body {
            BodyRef::Inline { bytes } => Ok(Bytes::from(bytes.clone())),
            BodyRef::Outsourced { handle, length } => {
                let body = self
                    .body_store
                    .get(handle)
                    .await
                    .map_err(|_| handle.clone())?;
                if body.len() as u64 != *length {
                    debug!(
                        request_id = %request.request_id,
                        declared = length,
                        actual = body.len(),
                        "outsourced body length differs from declaration"
                    );
                }
                Ok(body)
            }
        }
    }

    /// Applies the inline/outsourced placement policy to the target's
    /// reply. A body of exactly the threshold length is outsourced.
    async fn place_response_body(&self, request_id: uuid::Uuid, reply: TargetReply) -> TargetResponse {
        let body_len = reply.body.len() as u64;
        let body = if relay_proto::should_outsource(body_len, self.config.inline_body_threshold) {
            match self.body_store.put(reply.body.clone()).await {
                Ok(handle) => BodyRef::Outsourced {
                    handle,
                    length: body_len,
                },
                Err(error) => {
                    error!(
                        %request_id,
                        error_kind = "OutsourcingFailed",
                        %error,
                        "failed to persist response body"
                    );
                    // Best effort: a body the link can still carry goes
                    // inline, anything bigger is undeliverable.
                    if body_len <= INLINE_FALLBACK_LIMIT_BYTES {
                        BodyRef::Inline {
                            bytes: reply.body.to_vec(),
                        }
                    } else {
                        return TargetResponse::synthesized(request_id, status::OUTSOURCING_FAILED);
                    }
                }
            }
        } else {
            BodyRef::Inline {
                bytes: reply.body.to_vec(),
            }
        };

        TargetResponse {
            request_id,
            status: reply.status,
            headers: reply.headers,
            body,
            request_start: None,
            request_duration_ms: None,
        }
    }
}
