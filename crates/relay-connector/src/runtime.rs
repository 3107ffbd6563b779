//! Drives a connector: listens on the tenant's request topic, spawns one
//! worker task per inbound request, and publishes acknowledgements and
//! responses back over the link.

use std::sync::Arc;

use relay_link::{requests_topic, TunnelLink, RESPONSES_TOPIC};
use relay_proto::{AcknowledgeMode, ClientRequest, Envelope};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::worker::RequestWorker;

pub struct ConnectorRuntime {
    tenant: String,
    link: Arc<dyn TunnelLink>,
    worker: Arc<RequestWorker>,
}

impl ConnectorRuntime {
    pub fn new(tenant: impl Into<String>, link: Arc<dyn TunnelLink>, worker: RequestWorker) -> Self {
        Self {
            tenant: tenant.into(),
            link,
            worker: Arc::new(worker),
        }
    }

    /// Spawns the receive loop. The task runs until the link closes or the
    /// handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut inbound = self.link.subscribe(&requests_topic(&self.tenant));
        let tenant = self.tenant.clone();

        tokio::spawn(async move {
            loop {
                let request = match inbound.recv().await {
                    Ok(Envelope::Request(request)) => request,
                    Ok(other) => {
                        warn!(
                            %tenant,
                            request_id = %other.request_id(),
                            "unexpected envelope on request topic; dropping"
                        );
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%tenant, skipped, "connector lagged behind the request stream");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!(%tenant, "request stream closed; connector runtime stopping");
                        break;
                    }
                };

                let link = Arc::clone(&self.link);
                let worker = Arc::clone(&self.worker);
                tokio::spawn(async move {
                    process(link, worker, request).await;
                });
            }
        })
    }
}

/// Handles one request: acknowledge first (when the request demands it, so
/// the dispatcher knows the connector took ownership before the target
/// even runs), then invoke and answer.
async fn process(link: Arc<dyn TunnelLink>, worker: Arc<RequestWorker>, request: ClientRequest) {
    let request_id = request.request_id;

    if request.acknowledge_mode == AcknowledgeMode::ConnectorReceived {
        if let Err(error) = link.publish(RESPONSES_TOPIC, Envelope::Acknowledge { request_id }) {
            warn!(%request_id, %error, "failed to publish acknowledgement");
        }
    }

    let response = worker.handle(request).await;
    debug_assert_eq!(
        response.request_id, request_id,
        "worker must answer with the originating request id"
    );

    if let Err(error) = link.publish(RESPONSES_TOPIC, Envelope::Response(response)) {
        warn!(%request_id, %error, "failed to publish response");
    }
}
