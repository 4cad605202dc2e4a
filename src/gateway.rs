//! Thin gateway: forwards a fixed set of routes to the upstream converter
//!
//! JSON routes relay the upstream body and status unchanged. `/media/{file}`
//! is streamed through without buffering. Anything that goes wrong on the
//! way to the upstream becomes a 502 whose detail starts with
//! `upstream_error:`. HEAD is routed like GET and answered without a body.

use crate::body::{empty, json_response, stream, Body};
use crate::config::Config;
use crate::cors::Cors;
use crate::error::{json_error_response, ErrorCode, ErrorResponse};
use crate::proxy::X_REQUEST_ID;
use crate::server::Handler;
use crate::upstream::{JsonReply, UpstreamClient, UpstreamError};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use tracing::{debug, warn};
use uuid::Uuid;

/// Content type assumed for `/media` when the upstream sends none
const DEFAULT_MEDIA_TYPE: &str = "audio/mpeg";

/// Content type assumed for `POST /convert` bodies without one
const DEFAULT_BODY_TYPE: &str = "application/json";

pub struct Gateway {
    upstream: UpstreamClient,
    cors: Cors,
}

impl Gateway {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let base = config
            .gateway
            .upstream
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Set UPSTREAM_CONVERTER env var to your tunnel URL"))?;

        Ok(Self {
            upstream: UpstreamClient::new(base, &config.gateway)?,
            cors: Cors::new(&config.cors),
        })
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    async fn route(&self, req: Request<Incoming>, request_id: &str) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(String::from);

        match (&method, path.as_str()) {
            (&Method::GET | &Method::HEAD, "/") => json_response(
                StatusCode::OK,
                &serde_json::json!({"service": "Gateway", "upstream": self.upstream.base()}),
            ),
            (&Method::GET | &Method::HEAD, "/ping" | "/status") => {
                let url = self.upstream.url(&path);
                relay_json(self.upstream.get_json(&url).await, request_id)
            }
            (&Method::GET | &Method::HEAD, "/search" | "/convert") => {
                let url = self.upstream.url_with_query(&path, query.as_deref());
                relay_json(self.upstream.get_json(&url).await, request_id)
            }
            (&Method::POST, "/convert") => self.convert_post(req, query.as_deref(), request_id).await,
            (&Method::GET | &Method::HEAD, p)
                if p.starts_with("/media/") && p.len() > "/media/".len() =>
            {
                self.media(&p["/media/".len()..], request_id).await
            }
            (_, "/") | (_, "/ping") | (_, "/status") | (_, "/search") | (_, "/convert") => {
                json_error_response(ErrorCode::MethodNotAllowed, "Method Not Allowed")
            }
            (_, p) if p.starts_with("/media/") => {
                json_error_response(ErrorCode::MethodNotAllowed, "Method Not Allowed")
            }
            _ => json_error_response(ErrorCode::NotFound, "Not Found"),
        }
    }

    async fn convert_post(
        &self,
        req: Request<Incoming>,
        query: Option<&str>,
        request_id: &str,
    ) -> Response<Body> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_BODY_TYPE)
            .to_string();

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(request_id, error = %e, "Failed to read request body");
                return json_error_response(ErrorCode::BadRequest, "Failed to read request body");
            }
        };

        let url = self.upstream.url_with_query("/convert", query);
        relay_json(
            self.upstream.post_json(&url, &content_type, body).await,
            request_id,
        )
    }

    async fn media(&self, filename: &str, request_id: &str) -> Response<Body> {
        let url = self.upstream.url(&format!("/media/{}", filename));
        let response = match self.upstream.get_raw(&url).await {
            Ok(response) => response,
            Err(e) => return upstream_error(&e, request_id),
        };

        let status = response.status();
        if status != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            debug!(request_id, status = %status, "Upstream refused media request");
            return ErrorResponse::new(ErrorCode::UpstreamError, text)
                .with_status(status)
                .into_response();
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_MEDIA_TYPE));
        let content_length = response.headers().get(hyper::header::CONTENT_LENGTH).cloned();

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type);
        if let Some(length) = content_length {
            builder = builder.header(hyper::header::CONTENT_LENGTH, length);
        }

        builder
            .body(stream(response.bytes_stream()))
            .unwrap_or_else(|e| {
                warn!(request_id, error = %e, "Failed to build media response");
                json_error_response(ErrorCode::InternalError, "failed to build response")
            })
    }
}

fn relay_json(result: Result<JsonReply, UpstreamError>, request_id: &str) -> Response<Body> {
    match result {
        Ok(reply) => json_response(reply.status, &reply.body),
        Err(e) => upstream_error(&e, request_id),
    }
}

fn upstream_error(error: &UpstreamError, request_id: &str) -> Response<Body> {
    warn!(request_id, error = %error, "Upstream request failed");
    json_error_response(ErrorCode::UpstreamError, format!("upstream_error: {}", error))
}

impl Handler for Gateway {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn handle(&self, req: Request<Incoming>, _client_addr: SocketAddr) -> Response<Body> {
        if let Some(response) = self.cors.preflight(&req) {
            return response;
        }

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(method = %req.method(), uri = %req.uri(), request_id, "Gateway request");

        let request_headers = req.headers().clone();
        let head = req.method() == Method::HEAD;
        let mut response = self.route(req, &request_id).await;
        if head {
            *response.body_mut() = empty();
        }

        self.cors.decorate(&request_headers, &mut response);
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_requires_upstream() {
        let err = Gateway::new(&Config::default()).err().unwrap();
        assert!(err.to_string().contains("UPSTREAM_CONVERTER"));
    }

    #[test]
    fn test_upstream_error_detail_prefix() {
        let error = UpstreamError::Timeout(std::time::Duration::from_secs(60));
        let response = upstream_error(&error, "req-1");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_relay_keeps_upstream_status() {
        let reply = JsonReply {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: serde_json::json!({"detail": "bad url"}),
        };
        let response = relay_json(Ok(reply), "req-1");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], br#"{"detail":"bad url"}"#);
    }
}
