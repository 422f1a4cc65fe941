//! Core handler abstractions shared by every backend kind
//!
//! A route target compiles into a boxed [`RouteHandler`]. Handlers receive
//! requests whose body has already been boxed into the canonical [`HttpBody`]
//! type, so the same handler works behind the real server, the debug
//! interface and the test suite.

use crate::rewrite;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use std::sync::Arc;

/// Boxed error type used throughout the request path
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical streaming body type
pub type HttpBody = BoxBody<Bytes, BoxError>;

/// Request with the canonical body type
pub type HttpRequest = Request<HttpBody>;

/// Response with the canonical body type
pub type HttpResponse = Response<HttpBody>;

/// A compiled backend handler
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, req: HttpRequest) -> HttpResponse;
}

/// Build a body from a complete byte buffer
pub fn full_body(data: impl Into<Bytes>) -> HttpBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Build an empty body
pub fn empty_body() -> HttpBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Box an inbound hyper request body into the canonical body type
pub fn boxed_request(req: Request<Incoming>) -> HttpRequest {
    req.map(|b| b.map_err(BoxError::from).boxed())
}

/// Split `host[/path]` into the hostname and its mount sub-path.
///
/// The sub-path is empty when the hostname carries none.
pub fn split_host_path(hostname: &str) -> (&str, &str) {
    match hostname.find('/') {
        Some(i) => (&hostname[..i], &hostname[i..]),
        None => (hostname, ""),
    }
}

/// Join two URL path segments with exactly one slash at the seam
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Strip a mount prefix from a request path, re-asserting the leading slash
pub fn trim_path_prefix(path: &str, prefix: &str) -> String {
    let trimmed = path.strip_prefix(prefix).unwrap_or(path);
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Replace the path of a request URI, keeping the query string
pub fn replace_request_path<B>(req: &mut Request<B>, new_path: &str) {
    let path_and_query = match req.uri().query() {
        Some(q) => format!("{}?{}", new_path, q),
        None => new_path.to_string(),
    };
    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = path_and_query.parse().ok();
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
}

/// Wrapper that makes a backend behave as if it owned a mount sub-path.
///
/// Strips `host_path` from incoming request paths and routes the response
/// through the HTML path-prefix rewriter so generated links and `Location`
/// redirects stay inside the sub-path.
pub struct PathCombinator {
    hostname: String,
    host_path: String,
    target_path: String,
    inner: Arc<dyn RouteHandler>,
}

impl PathCombinator {
    pub fn new(
        hostname: &str,
        host_path: &str,
        target_path: &str,
        inner: Arc<dyn RouteHandler>,
    ) -> Self {
        Self {
            hostname: hostname.to_string(),
            host_path: host_path.to_string(),
            target_path: target_path.to_string(),
            inner,
        }
    }
}

#[async_trait]
impl RouteHandler for PathCombinator {
    async fn handle(&self, mut req: HttpRequest) -> HttpResponse {
        let trimmed = trim_path_prefix(req.uri().path(), &self.host_path);
        if trimmed != req.uri().path() {
            replace_request_path(&mut req, &trimmed);
        }
        let resp = self.inner.handle(req).await;
        rewrite::apply_path_prefix(&self.hostname, &self.host_path, &self.target_path, resp).await
    }
}
