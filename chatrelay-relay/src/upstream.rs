//! Upstream provider client.

use bytes::Bytes;
use chatrelay_core::{RelayConfig, RelayError};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use std::time::Duration;
use url::Url;

use crate::request::UpstreamRequest;

/// Largest error body kept for diagnostics.
const MAX_ERROR_BODY: usize = 4 * 1024;

/// Streaming response body from the upstream.
pub type UpstreamBody = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Opens streaming completions against the configured provider.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    url: Url,
    api_key: Option<String>,
}

impl UpstreamClient {
    /// Create a client from relay configuration.
    pub fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::configuration(format!("http client: {e}")))?;
        Ok(Self::with_client(http, config))
    }

    /// Create a client around an existing `reqwest` client.
    pub fn with_client(http: reqwest::Client, config: &RelayConfig) -> Self {
        Self {
            http,
            url: config.upstream_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    /// The upstream URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send the request and return the body stream once headers arrive.
    ///
    /// A non-success status is classified by [`RelayError::from_status`];
    /// the body is never streamed in that case.
    pub async fn open(&self, request: &UpstreamRequest<'_>) -> Result<UpstreamBody, RelayError> {
        let mut builder = self
            .http
            .post(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let mut body = response.text().await.unwrap_or_default();
            truncate_at_boundary(&mut body, MAX_ERROR_BODY);
            tracing::warn!(status = status.as_u16(), body = %body, "upstream rejected request");
            return Err(RelayError::from_status(status.as_u16(), body, retry_after));
        }

        tracing::debug!(model = request.model, "upstream stream opened");
        Ok(response.bytes_stream().boxed())
    }
}

/// Map a transport failure onto the error taxonomy.
pub fn classify_transport(error: reqwest::Error) -> RelayError {
    if error.is_timeout() {
        RelayError::GatewayTimeout { after: None }
    } else {
        RelayError::connection(error.to_string())
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate_at_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
