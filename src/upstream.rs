//! Reverse proxy to http/https upstreams
//!
//! All proxy handlers share one pooled hyper client; each handler rewrites
//! the request URI onto its target (joining paths, merging query strings)
//! and streams the upstream response back unchanged. Upstream failures come
//! back to the client as 502.

use crate::error::bad_gateway;
use crate::handler::{
    single_joining_slash, BoxError, HttpBody, HttpRequest, HttpResponse, RouteHandler,
};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::warn;
use url::Url;

/// Pooled client shared by every proxy handler
pub type SharedClient = Client<HttpsConnector<HttpConnector>, HttpBody>;

pub fn build_client() -> SharedClient {
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(10)
        .build(https)
}

pub struct ProxyHandler {
    target: Url,
    client: SharedClient,
}

impl ProxyHandler {
    pub fn new(target: Url, client: SharedClient) -> Self {
        Self { target, client }
    }

    fn upstream_uri(&self, req: &HttpRequest) -> String {
        let path = if self.target.path().is_empty() || self.target.path() == "/" {
            req.uri().path().to_string()
        } else {
            single_joining_slash(self.target.path(), req.uri().path())
        };

        let target_query = self.target.query().unwrap_or("");
        let req_query = req.uri().query().unwrap_or("");
        let query = if target_query.is_empty() || req_query.is_empty() {
            format!("{}{}", target_query, req_query)
        } else {
            format!("{}&{}", target_query, req_query)
        };

        let mut authority = self.target.host_str().unwrap_or_default().to_string();
        if let Some(port) = self.target.port() {
            authority = format!("{}:{}", authority, port);
        }

        let mut uri = format!("{}://{}{}", self.target.scheme(), authority, path);
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query);
        }
        uri
    }
}

#[async_trait]
impl RouteHandler for ProxyHandler {
    async fn handle(&self, mut req: HttpRequest) -> HttpResponse {
        let uri = self.upstream_uri(&req);
        match uri.parse() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => return bad_gateway(format!("bad upstream uri {:?}: {}", uri, e)),
        }

        let hop_by_hop: Vec<_> = req
            .headers()
            .keys()
            .filter(|name| is_hop_by_hop(name.as_str()))
            .cloned()
            .collect();
        for name in hop_by_hop {
            req.headers_mut().remove(name);
        }

        match self.client.request(req).await {
            Ok(resp) => resp.map(|b| b.map_err(BoxError::from).boxed()),
            Err(e) => {
                warn!(target = %self.target, error = %e, "upstream request failed");
                bad_gateway(format!("upstream error: {}", e))
            }
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
