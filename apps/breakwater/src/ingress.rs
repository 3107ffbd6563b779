//! Public HTTP surface: turns an inbound call into a relay context, runs
//! it through the dispatch coordinator, and writes the target's response
//! back to the original caller. Outsourced bodies are parked in the body
//! store on the way in and released through context disposables once the
//! response has been written.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use body_store::BodyStore;
use relay_connector::http_target::is_hop_by_hop;
use relay_proto::{status, AcknowledgeMode, BodyRef, ClientRequest, TargetResponse};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::context::{BodyStoreCleanup, RelayContext, RelayInterceptor};
use crate::dispatch::DispatchCoordinator;
use crate::statistics::StatisticsTracker;

/// Upper bound for buffering an inbound request body.
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<DispatchCoordinator>,
    pub tracker: StatisticsTracker,
    pub body_store: Arc<dyn BodyStore>,
    pub interceptors: Arc<Vec<Arc<dyn RelayInterceptor>>>,
    pub inline_body_threshold: u64,
    pub acknowledge_mode: AcknowledgeMode,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/relay/:tenant/:target", any(relay_root))
        .route("/relay/:tenant/:target/*path", any(relay_subpath))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn relay_root(
    State(state): State<AppState>,
    Path((tenant, target)): Path<(String, String)>,
    request: Request,
) -> Response {
    handle_relay(state, tenant, target, String::new(), request).await
}

async fn relay_subpath(
    State(state): State<AppState>,
    Path((tenant, target, path)): Path<(String, String, String)>,
    request: Request,
) -> Response {
    handle_relay(state, tenant, target, path, request).await
}

async fn handle_relay(
    state: AppState,
    tenant: String,
    target: String,
    path: String,
    request: Request,
) -> Response {
    let method = request.method().as_str().to_string();
    let query = request.uri().query().map(String::from);
    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            warn!(%tenant, %target, %err, "failed to read inbound request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let request_id = Uuid::new_v4();
    let mut request_body_handle = None;
    let body_ref = if relay_proto::should_outsource(body.len() as u64, state.inline_body_threshold)
    {
        match state.body_store.put(body.clone()).await {
            Ok(handle) => {
                debug!(%request_id, %handle, length = body.len(), "outsourced request body");
                request_body_handle = Some(handle.clone());
                BodyRef::Outsourced {
                    handle,
                    length: body.len() as u64,
                }
            }
            Err(err) => {
                error!(%request_id, %err, "failed to outsource request body");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    } else {
        BodyRef::Inline {
            bytes: body.to_vec(),
        }
    };

    let client_request = ClientRequest {
        request_id,
        tenant: tenant.clone(),
        target,
        method,
        path: format!("/{}", path.trim_start_matches('/')),
        query,
        headers,
        body: body_ref,
        acknowledge_mode: state.acknowledge_mode,
    };

    let connector_available = state.tracker.is_tenant_available(&tenant).await;
    let mut context = RelayContext::new(client_request, connector_available);
    if let Some(handle) = request_body_handle {
        context.add_disposable(Box::new(BodyStoreCleanup::new(
            Arc::clone(&state.body_store),
            handle,
        )));
    }

    for interceptor in state.interceptors.iter() {
        interceptor.on_request(&mut context).await;
    }

    state.coordinator.relay(&mut context).await;

    let response = context
        .take_target_response()
        .unwrap_or_else(|| TargetResponse::synthesized(request_id, status::NO_CONNECTOR_AVAILABLE));

    let http_response = write_response(&state, &mut context, response).await;
    context.dispose().await;
    http_response
}

/// Materializes the target response as an HTTP response, fetching an
/// outsourced body from the store (and scheduling its deletion) first.
async fn write_response(
    state: &AppState,
    context: &mut RelayContext,
    response: TargetResponse,
) -> Response {
    let request_id = response.request_id;
    let body = match response.body {
        BodyRef::Inline { bytes } => bytes::Bytes::from(bytes),
        BodyRef::Outsourced { handle, length } => {
            context.add_disposable(Box::new(BodyStoreCleanup::new(
                Arc::clone(&state.body_store),
                handle.clone(),
            )));
            match state.body_store.get(&handle).await {
                Ok(body) => {
                    debug!(%request_id, %handle, length, "fetched outsourced response body");
                    body
                }
                Err(err) => {
                    warn!(%request_id, %handle, %err, "outsourced response body unavailable");
                    return StatusCode::from_u16(status::BODY_UNAVAILABLE)
                        .unwrap_or(StatusCode::BAD_GATEWAY)
                        .into_response();
                }
            }
        }
    };

    let status_code =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut http_response = Response::new(Body::from(body));
    *http_response.status_mut() = status_code;
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        http_response.headers_mut().append(name, value);
    }
    http_response
}
