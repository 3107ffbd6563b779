//! Server-side dispatch: decides per inbound request whether any connector
//! can serve it, pushes the request over the tunnel link, and waits for the
//! response under the overall relay timeout. Responses for requests that no
//! longer have an open context are discarded, never matched elsewhere.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use relay_link::{requests_topic, TunnelLink, RESPONSES_TOPIC};
use relay_proto::{status, Envelope, TargetResponse};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ForcedDeliveryPolicy;
use crate::context::RelayContext;

struct PendingRelay {
    responder: Option<oneshot::Sender<TargetResponse>>,
    /// Set when the connector confirms receipt. Informational on this
    /// side: the wait stays bounded by the relay timeout either way, and
    /// retiring delivery retries on ack is the transport host's concern.
    acknowledged: bool,
}

pub struct DispatchCoordinator {
    link: Arc<dyn TunnelLink>,
    relay_timeout: Duration,
    forced_delivery_policy: ForcedDeliveryPolicy,
    pending: Arc<DashMap<Uuid, PendingRelay>>,
    listener: JoinHandle<()>,
}

impl DispatchCoordinator {
    pub fn new(
        link: Arc<dyn TunnelLink>,
        relay_timeout: Duration,
        forced_delivery_policy: ForcedDeliveryPolicy,
    ) -> Self {
        let pending: Arc<DashMap<Uuid, PendingRelay>> = Arc::new(DashMap::new());
        let listener = spawn_response_listener(Arc::clone(&link), Arc::clone(&pending));
        Self {
            link,
            relay_timeout,
            forced_delivery_policy,
            pending,
            listener,
        }
    }

    /// Relays the context's request to a connector and completes the
    /// context with the outcome. Always leaves a response on the context
    /// unless an interceptor short-circuited with one of its own.
    pub async fn relay(&self, context: &mut RelayContext) {
        let request_id = context.request_id();

        let intercepted = context.target_response().is_some();
        if intercepted && !context.force_connector_delivery {
            debug!(%request_id, "interceptor response set; skipping connector delivery");
            return;
        }

        if !context.connector_available() {
            debug!(
                %request_id,
                tenant = %context.client_request().tenant,
                "no connector available for tenant"
            );
            if !intercepted {
                context.set_target_response(TargetResponse::synthesized(
                    request_id,
                    status::NO_CONNECTOR_AVAILABLE,
                ));
            }
            return;
        }

        let (responder, response_rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingRelay {
                responder: Some(responder),
                acknowledged: false,
            },
        );
        // Removes the pending entry on every exit path, including the
        // caller disconnecting and dropping this future mid-wait. A late
        // response then finds no open context and is discarded.
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            request_id,
        };

        let topic = requests_topic(&context.client_request().tenant);
        let envelope = Envelope::Request(context.client_request().clone());
        if let Err(err) = self.link.publish(&topic, envelope) {
            warn!(%request_id, %err, "failed to push request over the tunnel link");
            if !intercepted {
                context.set_target_response(TargetResponse::synthesized(
                    request_id,
                    status::NO_CONNECTOR_AVAILABLE,
                ));
            }
            return;
        }

        match tokio::time::timeout(self.relay_timeout, response_rx).await {
            Ok(Ok(response)) => {
                if intercepted
                    && self.forced_delivery_policy == ForcedDeliveryPolicy::KeepInterceptorResponse
                {
                    debug!(
                        %request_id,
                        "forced delivery completed; keeping interceptor response"
                    );
                } else {
                    context.set_target_response(response);
                }
            }
            Ok(Err(_closed)) => {
                warn!(%request_id, "response channel closed before completion");
                if context.target_response().is_none() {
                    context.set_target_response(TargetResponse::synthesized(
                        request_id,
                        status::DISPATCH_TIMEOUT,
                    ));
                }
            }
            Err(_elapsed) => {
                warn!(
                    %request_id,
                    timeout_ms = self.relay_timeout.as_millis() as u64,
                    "relay timed out waiting for a connector response"
                );
                if context.target_response().is_none() {
                    context.set_target_response(TargetResponse::synthesized(
                        request_id,
                        status::DISPATCH_TIMEOUT,
                    ));
                }
            }
        }
    }
}

impl Drop for DispatchCoordinator {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct PendingGuard {
    pending: Arc<DashMap<Uuid, PendingRelay>>,
    request_id: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

fn spawn_response_listener(
    link: Arc<dyn TunnelLink>,
    pending: Arc<DashMap<Uuid, PendingRelay>>,
) -> JoinHandle<()> {
    let mut inbound = link.subscribe(RESPONSES_TOPIC);
    tokio::spawn(async move {
        loop {
            let envelope = match inbound.recv().await {
                Ok(envelope) => envelope,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dispatch listener lagged behind the response stream");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            match envelope {
                Envelope::Acknowledge { request_id } => {
                    match pending.get_mut(&request_id) {
                        Some(mut entry) => {
                            entry.acknowledged = true;
                            debug!(%request_id, "connector acknowledged the request");
                        }
                        None => {
                            warn!(%request_id, "acknowledge for unknown request; dropping");
                        }
                    }
                }
                Envelope::Response(response) => {
                    let request_id = response.request_id;
                    match pending.remove(&request_id) {
                        Some((_, mut entry)) => {
                            if !entry.acknowledged {
                                debug!(%request_id, "response arrived without prior acknowledge");
                            }
                            if let Some(responder) = entry.responder.take() {
                                let _ = responder.send(response);
                            }
                        }
                        None => {
                            // Request id no longer has an open context:
                            // timed out, cancelled, or simply stray.
                            warn!(%request_id, "discarding response without an open context");
                        }
                    }
                }
                Envelope::Request(request) => {
                    warn!(
                        request_id = %request.request_id,
                        "request envelope on response topic; dropping"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_link::InProcessLink;
    use relay_proto::{AcknowledgeMode, BodyRef, ClientRequest};

    fn request(tenant: &str) -> ClientRequest {
        ClientRequest {
            request_id: Uuid::new_v4(),
            tenant: tenant.into(),
            target: "billing".into(),
            method: "GET".into(),
            path: "/".into(),
            query: None,
            headers: Vec::new(),
            body: BodyRef::empty(),
            acknowledge_mode: AcknowledgeMode::Disabled,
        }
    }

    /// Answers every request on the link with the given status after an
    /// optional delay.
    fn spawn_responder(link: Arc<InProcessLink>, status_code: u16, delay: Duration) {
        let mut inbound = link.subscribe(&requests_topic("acme"));
        tokio::spawn(async move {
            while let Ok(envelope) = inbound.recv().await {
                if let Envelope::Request(request) = envelope {
                    let link = Arc::clone(&link);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let response = TargetResponse::synthesized(request.request_id, status_code);
                        link.publish(RESPONSES_TOPIC, Envelope::Response(response))
                            .expect("publish response");
                    });
                }
            }
        });
    }

    fn coordinator(
        link: Arc<InProcessLink>,
        timeout: Duration,
        policy: ForcedDeliveryPolicy,
    ) -> DispatchCoordinator {
        DispatchCoordinator::new(link, timeout, policy)
    }

    #[tokio::test]
    async fn completes_context_with_connector_response() {
        let link = Arc::new(InProcessLink::new());
        spawn_responder(Arc::clone(&link), 200, Duration::ZERO);
        let coordinator = coordinator(
            Arc::clone(&link),
            Duration::from_secs(5),
            ForcedDeliveryPolicy::PreferConnectorResponse,
        );

        let mut context = RelayContext::new(request("acme"), true);
        coordinator.relay(&mut context).await;

        assert_eq!(context.target_response().unwrap().status, 200);
        assert!(coordinator.pending.is_empty());
    }

    #[tokio::test]
    async fn no_connector_yields_defined_status_without_transport_contact() {
        let link = Arc::new(InProcessLink::new());
        let mut requests = link.subscribe(&requests_topic("acme"));
        let coordinator = coordinator(
            Arc::clone(&link),
            Duration::from_secs(5),
            ForcedDeliveryPolicy::PreferConnectorResponse,
        );

        let mut context = RelayContext::new(request("acme"), false);
        coordinator.relay(&mut context).await;

        assert_eq!(
            context.target_response().unwrap().status,
            status::NO_CONNECTOR_AVAILABLE
        );
        assert!(matches!(
            requests.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn interceptor_response_short_circuits_delivery() {
        let link = Arc::new(InProcessLink::new());
        let mut requests = link.subscribe(&requests_topic("acme"));
        let coordinator = coordinator(
            Arc::clone(&link),
            Duration::from_secs(5),
            ForcedDeliveryPolicy::PreferConnectorResponse,
        );

        let client_request = request("acme");
        let request_id = client_request.request_id;
        let mut context = RelayContext::new(client_request, true);
        context.set_target_response(TargetResponse::synthesized(request_id, 418));

        coordinator.relay(&mut context).await;

        assert_eq!(context.target_response().unwrap().status, 418);
        assert!(matches!(
            requests.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn forced_delivery_can_prefer_the_connector_response() {
        let link = Arc::new(InProcessLink::new());
        spawn_responder(Arc::clone(&link), 200, Duration::ZERO);
        let coordinator = coordinator(
            Arc::clone(&link),
            Duration::from_secs(5),
            ForcedDeliveryPolicy::PreferConnectorResponse,
        );

        let client_request = request("acme");
        let request_id = client_request.request_id;
        let mut context = RelayContext::new(client_request, true);
        context.set_target_response(TargetResponse::synthesized(request_id, 418));
        context.force_connector_delivery = true;

        coordinator.relay(&mut context).await;
        assert_eq!(context.target_response().unwrap().status, 200);
    }

    #[tokio::test]
    async fn forced_delivery_can_keep_the_interceptor_response() {
        let link = Arc::new(InProcessLink::new());
        spawn_responder(Arc::clone(&link), 200, Duration::ZERO);
        let coordinator = coordinator(
            Arc::clone(&link),
            Duration::from_secs(5),
            ForcedDeliveryPolicy::KeepInterceptorResponse,
        );

        let client_request = request("acme");
        let request_id = client_request.request_id;
        let mut context = RelayContext::new(client_request, true);
        context.set_target_response(TargetResponse::synthesized(request_id, 418));
        context.force_connector_delivery = true;

        coordinator.relay(&mut context).await;
        assert_eq!(context.target_response().unwrap().status, 418);
    }

    #[tokio::test]
    async fn timeout_synthesizes_response_and_late_answer_is_discarded() {
        let link = Arc::new(InProcessLink::new());
        spawn_responder(Arc::clone(&link), 200, Duration::from_millis(200));
        let coordinator = coordinator(
            Arc::clone(&link),
            Duration::from_millis(20),
            ForcedDeliveryPolicy::PreferConnectorResponse,
        );

        let mut context = RelayContext::new(request("acme"), true);
        coordinator.relay(&mut context).await;

        assert_eq!(
            context.target_response().unwrap().status,
            status::DISPATCH_TIMEOUT
        );
        assert!(coordinator.pending.is_empty());

        // Let the late response arrive; it must be dropped quietly.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            context.target_response().unwrap().status,
            status::DISPATCH_TIMEOUT
        );
        assert!(coordinator.pending.is_empty());
    }
}
