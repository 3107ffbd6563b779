//! End-to-end relay coverage: HTTP ingress → dispatch → in-process link →
//! connector runtime → registered target, and back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use body_store::MemoryBodyStore;
use breakwater::config::ForcedDeliveryPolicy;
use breakwater::dispatch::DispatchCoordinator;
use breakwater::ingress::{router, AppState};
use breakwater::statistics::{store::MemoryStatisticsStore, StatisticsTracker};
use bytes::Bytes;
use http_body_util::BodyExt;
use relay_connector::registry::{RelayTarget, TargetReply, TargetRequest, TargetRegistry};
use relay_connector::{ConnectorRuntime, RequestWorker, WorkerConfig};
use relay_link::{requests_topic, InProcessLink, TunnelLink};
use relay_proto::AcknowledgeMode;
use tower::ServiceExt;
use uuid::Uuid;

const THRESHOLD: u64 = 16;

struct Harness {
    app: axum::Router,
    link: Arc<InProcessLink>,
    body_store: Arc<MemoryBodyStore>,
    tracker: StatisticsTracker,
}

fn harness(relay_timeout: Duration) -> Harness {
    let link = Arc::new(InProcessLink::new());
    let body_store = Arc::new(MemoryBodyStore::new());
    let stats = Arc::new(MemoryStatisticsStore::new());
    let tracker = StatisticsTracker::new(stats, Duration::from_secs(120));

    let tunnel: Arc<dyn TunnelLink> = link.clone();
    let coordinator = Arc::new(DispatchCoordinator::new(
        tunnel,
        relay_timeout,
        ForcedDeliveryPolicy::PreferConnectorResponse,
    ));

    let app = router(AppState {
        coordinator,
        tracker: tracker.clone(),
        body_store: body_store.clone(),
        interceptors: Arc::new(Vec::new()),
        inline_body_threshold: THRESHOLD,
        acknowledge_mode: AcknowledgeMode::ConnectorReceived,
    });

    Harness {
        app,
        link,
        body_store,
        tracker,
    }
}

/// Attaches a connector for the tenant with the given targets and records
/// a live connection row so the tenant reads as available.
async fn attach_connector(
    harness: &Harness,
    tenant: &str,
    targets: Vec<(&str, Arc<dyn RelayTarget>)>,
    target_timeout: Duration,
) {
    let registry = Arc::new(TargetRegistry::new());
    for (key, target) in targets {
        registry.register(key, target).unwrap();
    }
    let worker = RequestWorker::new(
        registry,
        harness.body_store.clone(),
        WorkerConfig {
            target_timeout,
            inline_body_threshold: THRESHOLD,
        },
    );
    let tunnel: Arc<dyn TunnelLink> = harness.link.clone();
    let _runtime = ConnectorRuntime::new(tenant, tunnel, worker).spawn();

    harness
        .tracker
        .record_connect("conn-1", tenant, Uuid::new_v4(), None)
        .await;
}

struct FixedTarget {
    status: u16,
    body: &'static [u8],
}

#[async_trait]
impl RelayTarget for FixedTarget {
    async fn invoke(&self, _request: TargetRequest) -> anyhow::Result<TargetReply> {
        Ok(TargetReply {
            status: self.status,
            headers: vec![("content-type".into(), "text/plain".into())],
            body: Bytes::from_static(self.body),
        })
    }
}

struct EchoTarget;

#[async_trait]
impl RelayTarget for EchoTarget {
    async fn invoke(&self, request: TargetRequest) -> anyhow::Result<TargetReply> {
        Ok(TargetReply {
            status: 200,
            headers: Vec::new(),
            body: request.body,
        })
    }
}

struct SlowTarget;

#[async_trait]
impl RelayTarget for SlowTarget {
    async fn invoke(&self, _request: TargetRequest) -> anyhow::Result<TargetReply> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(TargetReply {
            status: 200,
            headers: Vec::new(),
            body: Bytes::new(),
        })
    }
}

async fn send(
    harness: &Harness,
    method: &str,
    uri: &str,
    body: Vec<u8>,
) -> (StatusCode, Bytes) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body))
        .unwrap();
    let response = harness.app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

#[tokio::test]
async fn small_bodies_relay_inline_end_to_end() {
    let harness = harness(Duration::from_secs(5));
    attach_connector(
        &harness,
        "acme",
        vec![(
            "billing",
            Arc::new(FixedTarget {
                status: 200,
                body: b"5byte",
            }),
        )],
        Duration::from_secs(5),
    )
    .await;

    let (status, body) = send(&harness, "POST", "/relay/acme/billing/invoices", b"10bytebody".to_vec()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"5byte"));
    // Both bodies were under the threshold: nothing was outsourced.
    assert!(harness.body_store.is_empty());
}

#[tokio::test]
async fn large_echo_round_trips_through_the_body_store() {
    let harness = harness(Duration::from_secs(5));
    attach_connector(
        &harness,
        "acme",
        vec![("echo", Arc::new(EchoTarget))],
        Duration::from_secs(5),
    )
    .await;

    let payload: Vec<u8> = (0..(THRESHOLD * 2) as usize).map(|i| i as u8).collect();
    let (status, body) = send(&harness, "POST", "/relay/acme/echo/blob", payload.clone()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from(payload));
    // Request and response handles were both released by the context.
    assert!(
        harness.body_store.is_empty(),
        "body store should be drained after the response completes"
    );
}

#[tokio::test]
async fn missing_connector_yields_service_unavailable_without_transport_contact() {
    let harness = harness(Duration::from_secs(5));
    let mut requests = harness.link.subscribe(&requests_topic("acme"));

    let (status, _) = send(&harness, "GET", "/relay/acme/billing", Vec::new()).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(matches!(
        requests.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn disconnected_tenant_is_unavailable_again() {
    let harness = harness(Duration::from_secs(5));
    attach_connector(
        &harness,
        "acme",
        vec![(
            "billing",
            Arc::new(FixedTarget {
                status: 204,
                body: b"",
            }),
        )],
        Duration::from_secs(5),
    )
    .await;

    let (status, _) = send(&harness, "GET", "/relay/acme/billing", Vec::new()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    harness.tracker.record_disconnect("conn-1").await;
    let (status, _) = send(&harness, "GET", "/relay/acme/billing", Vec::new()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unregistered_target_key_maps_to_bad_gateway() {
    let harness = harness(Duration::from_secs(5));
    attach_connector(
        &harness,
        "acme",
        vec![(
            "billing",
            Arc::new(FixedTarget {
                status: 200,
                body: b"",
            }),
        )],
        Duration::from_secs(5),
    )
    .await;

    let (status, _) = send(&harness, "GET", "/relay/acme/unknown", Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn abandoned_caller_still_releases_outsourced_bodies() {
    let harness = harness(Duration::from_secs(5));
    attach_connector(
        &harness,
        "acme",
        vec![("slow", Arc::new(SlowTarget))],
        Duration::from_secs(5),
    )
    .await;

    let payload = vec![1u8; (THRESHOLD * 2) as usize]; // outsourced at ingress
    let request = Request::builder()
        .method("POST")
        .uri("/relay/acme/slow")
        .body(Body::from(payload))
        .unwrap();

    // The caller gives up long before the target answers; dropping the
    // in-flight handler future must not strand the request body handle.
    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        harness.app.clone().oneshot(request),
    )
    .await;
    assert!(outcome.is_err(), "caller should have disconnected first");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(
        harness.body_store.is_empty(),
        "request body handle must be released after the caller disconnects"
    );
}

#[tokio::test]
async fn slow_connector_times_out_and_late_response_is_discarded() {
    let harness = harness(Duration::from_millis(50));
    attach_connector(
        &harness,
        "acme",
        vec![("slow", Arc::new(SlowTarget))],
        Duration::from_secs(5),
    )
    .await;

    let (status, _) = send(&harness, "GET", "/relay/acme/slow", Vec::new()).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

    // The target answers long after the context closed; the stray response
    // must be dropped without disturbing anything.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(harness.body_store.is_empty());
}
