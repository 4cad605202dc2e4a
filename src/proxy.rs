use crate::body::{json_response, Body};
use crate::config::ProxyConfig;
use crate::error::{json_error_response, ErrorCode};
use crate::pool::{ConnectionPool, PoolConfig, PoolError, Upstream};
use crate::server::Handler;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Generic reverse proxy in front of a single upstream
pub struct ReverseProxy {
    upstream: Upstream,
    upstream_url: String,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    health_path: String,
    preserve_host: bool,
}

impl ReverseProxy {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let upstream_url = config
            .upstream
            .clone()
            .ok_or_else(|| anyhow::anyhow!("proxy upstream is not configured"))?;
        let upstream = Upstream::parse(&upstream_url)?;

        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        }));

        Ok(Self {
            upstream,
            upstream_url,
            pool,
            request_timeout: config.request_timeout(),
            health_path: config.health_path.clone(),
            preserve_host: config.preserve_host,
        })
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn health_response(&self) -> Response<Body> {
        let stats = self.pool.stats();
        json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "ok",
                "upstream": self.upstream_url,
                "requests": stats.get_total_requests(),
                "failed_requests": stats.get_failed_requests(),
            }),
        )
    }
}

impl Handler for ReverseProxy {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn handle(&self, mut req: Request<Incoming>, client_addr: SocketAddr) -> Response<Body> {
        if req.method() == Method::GET && req.uri().path() == self.health_path {
            return self.health_response();
        }

        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // X-Forwarded-* are overwritten, never appended: this is the first hop
        let headers = req.headers_mut();

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        match headers.get(hyper::header::HOST).cloned() {
            Some(host) => {
                headers.insert(X_FORWARDED_HOST, host);
            }
            None => {
                headers.remove(X_FORWARDED_HOST);
            }
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        let host = if self.preserve_host {
            None
        } else {
            HeaderValue::from_str(&self.upstream.authority).ok()
        };

        debug!(method = %req.method(), uri = %req.uri(), request_id, "Proxying request");

        let result = tokio::time::timeout(
            self.request_timeout,
            self.pool.send_request(req, &self.upstream, host),
        )
        .await;

        let mut response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(PoolError::RequestBuild(e))) => {
                error!(request_id, error = %e, "Failed to build upstream request");
                json_error_response(ErrorCode::InternalError, "Failed to build upstream request")
            }
            Ok(Err(e)) => {
                error!(upstream = %self.upstream_url, request_id, error = %e, "Failed to forward request");
                json_error_response(ErrorCode::UpstreamError, "upstream_error: failed to connect to upstream")
            }
            Err(_) => {
                warn!(
                    upstream = %self.upstream_url,
                    request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ErrorCode::UpstreamTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        response
    }
}
