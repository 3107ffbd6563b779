//! Bundled target implementation that forwards relayed requests to a local
//! HTTP service, e.g. an intranet API the connector sits next to.

use async_trait::async_trait;
use tracing::debug;

use crate::registry::{RelayTarget, TargetReply, TargetRequest};

/// Headers that belong to one hop and must not be forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|header| name.eq_ignore_ascii_case(header))
}

pub struct HttpTarget {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTarget {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    fn url_for(&self, request: &TargetRequest) -> String {
        let path = request.path.trim_start_matches('/');
        match &request.query {
            Some(query) if !query.is_empty() => {
                format!("{}/{}?{}", self.base_url, path, query)
            }
            _ => format!("{}/{}", self.base_url, path),
        }
    }
}

#[async_trait]
impl RelayTarget for HttpTarget {
    async fn invoke(&self, request: TargetRequest) -> anyhow::Result<TargetReply> {
        let url = self.url_for(&request);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())?;
        debug!(%method, %url, "forwarding relayed request to local target");

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name) {
                builder = builder.header(name, value);
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
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
        let body = response.bytes().await?;

        Ok(TargetReply {
            status,
            headers,
            body,
        })
    }
}
