//! Per-request aggregate owned by the server for the lifetime of one
//! relayed HTTP call. Carries the client request, the eventual target
//! response, the availability snapshot taken at creation, and every
//! disposable resource (outsourced body handles) that must be released
//! once the HTTP response has been written.

use std::sync::Arc;

use async_trait::async_trait;
use body_store::BodyStore;
use relay_proto::{ClientRequest, TargetResponse};
use tracing::warn;

/// A resource to release when the relayed HTTP response completes.
#[async_trait]
pub trait ResponseDisposable: Send + Sync {
    async fn dispose(&self) -> anyhow::Result<()>;
}

/// Deletes an outsourced body when the context is disposed.
pub struct BodyStoreCleanup {
    store: Arc<dyn BodyStore>,
    handle: String,
}

impl BodyStoreCleanup {
    pub fn new(store: Arc<dyn BodyStore>, handle: impl Into<String>) -> Self {
        Self {
            store,
            handle: handle.into(),
        }
    }
}

#[async_trait]
impl ResponseDisposable for BodyStoreCleanup {
    async fn dispose(&self) -> anyhow::Result<()> {
        self.store.delete(&self.handle).await?;
        Ok(())
    }
}

/// Extensibility hook that may set a response before dispatch, which by
/// default short-circuits connector delivery (see
/// [`RelayContext::force_connector_delivery`]).
#[async_trait]
pub trait RelayInterceptor: Send + Sync {
    async fn on_request(&self, context: &mut RelayContext);
}

pub struct RelayContext {
    client_request: ClientRequest,
    target_response: Option<TargetResponse>,
    connector_available: bool,
    /// Send the request to a connector even though a response is already
    /// set; which response wins is decided by the configured
    /// forced-delivery policy.
    pub force_connector_delivery: bool,
    disposables: Vec<Box<dyn ResponseDisposable>>,
}

impl RelayContext {
    pub fn new(client_request: ClientRequest, connector_available: bool) -> Self {
        Self {
            client_request,
            target_response: None,
            connector_available,
            force_connector_delivery: false,
            disposables: Vec::new(),
        }
    }

    pub fn request_id(&self) -> uuid::Uuid {
        self.client_request.request_id
    }

    pub fn client_request(&self) -> &ClientRequest {
        &self.client_request
    }

    /// Availability snapshot taken when the context was created; not
    /// re-checked mid-flight.
    pub fn connector_available(&self) -> bool {
        self.connector_available
    }

    pub fn target_response(&self) -> Option<&TargetResponse> {
        self.target_response.as_ref()
    }

    /// Settable once by an interceptor or by the dispatch result;
    /// last write wins.
    pub fn set_target_response(&mut self, response: TargetResponse) {
        self.target_response = Some(response);
    }

    pub fn take_target_response(&mut self) -> Option<TargetResponse> {
        self.target_response.take()
    }

    pub fn add_disposable(&mut self, disposable: Box<dyn ResponseDisposable>) {
        self.disposables.push(disposable);
    }

    /// Releases every accumulated disposable exactly once. Individual
    /// failures are logged and swallowed so one failing cleanup cannot
    /// block the others; calling this again is a no-op.
    pub async fn dispose(&mut self) {
        for disposable in self.disposables.drain(..) {
            if let Err(err) = disposable.dispose().await {
                warn!(
                    request_id = %self.client_request.request_id,
                    %err,
                    "failed to release a response disposable"
                );
            }
        }
    }
}

impl Drop for RelayContext {
    /// The handler future owning this context is dropped without a
    /// `dispose()` call when the HTTP caller disconnects mid-relay. Any
    /// disposables still pending are handed to a detached task so the
    /// resources they guard are released regardless.
    fn drop(&mut self) {
        if self.disposables.is_empty() {
            return;
        }
        let disposables = std::mem::take(&mut self.disposables);
        let request_id = self.client_request.request_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for disposable in disposables {
                        if let Err(err) = disposable.dispose().await {
                            warn!(
                                %request_id,
                                %err,
                                "failed to release a response disposable"
                            );
                        }
                    }
                });
            }
            Err(_) => {
                warn!(%request_id, "context dropped outside a runtime with pending disposables");
            }
        }
    }
}
