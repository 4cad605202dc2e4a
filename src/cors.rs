//! Permissive CORS handling for the thin gateway
//!
//! Matches a middleware configured with any method, any header and no
//! credentials. Origins are either `*` or an explicit allow-list.

use crate::body::{full, Body};
use crate::config::CorsConfig;
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
    ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
};
use hyper::{Method, Request, Response, StatusCode};

const ALLOWED_METHODS: &str = "DELETE, GET, HEAD, OPTIONS, PATCH, POST, PUT";

#[derive(Debug, Clone)]
pub struct Cors {
    allow_any: bool,
    origins: Vec<String>,
    max_age: String,
}

impl Cors {
    pub fn new(config: &CorsConfig) -> Self {
        Self {
            allow_any: config.allow_origins.iter().any(|o| o == "*"),
            origins: config.allow_origins.clone(),
            max_age: config.max_age_secs.to_string(),
        }
    }

    fn is_allowed(&self, origin: &str) -> bool {
        self.allow_any || self.origins.iter().any(|o| o == origin)
    }

    fn allow_origin_value(&self, origin: &str) -> Option<HeaderValue> {
        if self.allow_any {
            Some(HeaderValue::from_static("*"))
        } else if self.is_allowed(origin) {
            HeaderValue::from_str(origin).ok()
        } else {
            None
        }
    }

    /// Answer a preflight request, or `None` if `req` is not one
    pub fn preflight<B>(&self, req: &Request<B>) -> Option<Response<Body>> {
        if req.method() != Method::OPTIONS {
            return None;
        }
        let origin = req.headers().get(ORIGIN)?.to_str().ok()?;
        req.headers().get(ACCESS_CONTROL_REQUEST_METHOD)?;

        let Some(allow_origin) = self.allow_origin_value(origin) else {
            return Some(
                Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .header(hyper::header::CONTENT_TYPE, "text/plain")
                    .body(full("Disallowed CORS origin"))
                    .expect("valid response with static headers"),
            );
        };

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin)
            .header(ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS)
            .header(ACCESS_CONTROL_MAX_AGE, self.max_age.as_str())
            .header(hyper::header::CONTENT_TYPE, "text/plain");

        if let Some(requested) = req.headers().get(ACCESS_CONTROL_REQUEST_HEADERS) {
            builder = builder.header(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        if !self.allow_any {
            builder = builder.header(VARY, "Origin");
        }

        Some(builder.body(full("OK")).expect("valid preflight response"))
    }

    /// Add CORS headers to a normal response for the request's `Origin`
    pub fn decorate(&self, request_headers: &HeaderMap, response: &mut Response<Body>) {
        let Some(origin) = request_headers.get(ORIGIN).and_then(|v| v.to_str().ok()) else {
            return;
        };
        if let Some(value) = self.allow_origin_value(origin) {
            let headers = response.headers_mut();
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
            if !self.allow_any {
                headers.append(VARY, HeaderValue::from_static("Origin"));
            }
        }
    }
}
