//! HTTP client used by the thin gateway to reach the upstream converter
//!
//! The client is pinned to HTTP/1.1 over rustls so the wire behaviour does
//! not depend on what the upstream or the tunnel in front of it negotiates.

use crate::config::GatewayConfig;
use hyper::body::Bytes;
use hyper::StatusCode;
use reqwest::redirect::Policy;
use std::time::Duration;

/// Maximum redirect hops followed when redirects are enabled
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Transport(#[source] reqwest::Error),
    #[error("invalid JSON from upstream (status {status}): {source}")]
    InvalidJson {
        status: StatusCode,
        #[source]
        source: serde_json::Error,
    },
}

/// Client bound to one upstream base URL
pub struct UpstreamClient {
    client: reqwest::Client,
    base: String,
    timeout: Duration,
}

/// A fully-read upstream JSON response
#[derive(Debug)]
pub struct JsonReply {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl UpstreamClient {
    pub fn new(base: &str, config: &GatewayConfig) -> anyhow::Result<Self> {
        let redirect = if config.follow_redirects {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::none()
        };

        let client = reqwest::Client::builder()
            .http1_only()
            .use_rustls_tls()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .redirect(redirect)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build upstream HTTP client: {}", e))?;

        Ok(Self {
            client,
            base: base.to_string(),
            timeout: config.timeout(),
        })
    }

    /// Upstream base URL as configured
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Join `path` onto the base URL, ignoring trailing slashes on the base
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base.trim_end_matches('/'), path)
    }

    /// Join `path` and a raw query string
    pub fn url_with_query(&self, path: &str, query: Option<&str>) -> String {
        match query.filter(|q| !q.is_empty()) {
            Some(q) => format!("{}?{}", self.url(path), q),
            None => self.url(path),
        }
    }

    fn map_err(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else {
            UpstreamError::Transport(e)
        }
    }

    /// GET `url` and parse the body as JSON, whatever the status
    pub async fn get_json(&self, url: &str) -> Result<JsonReply, UpstreamError> {
        let response = self.client.get(url).send().await.map_err(|e| self.map_err(e))?;
        self.read_json(response).await
    }

    /// POST a raw body and parse the reply as JSON, whatever the status
    pub async fn post_json(
        &self,
        url: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<JsonReply, UpstreamError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.read_json(response).await
    }

    /// GET `url` and hand back the response unread, for streaming
    pub async fn get_raw(&self, url: &str) -> Result<reqwest::Response, UpstreamError> {
        self.client.get(url).send().await.map_err(|e| self.map_err(e))
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<JsonReply, UpstreamError> {
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.map_err(e))?;
        let body = serde_json::from_slice(&bytes)
            .map_err(|source| UpstreamError::InvalidJson { status, source })?;
        Ok(JsonReply { status, body })
    }
}
