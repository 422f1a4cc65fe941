//! Serving loop and route lifecycle
//!
//! One task consumes config-event batches and mutates the per-host route
//! tables; many connection tasks serve requests concurrently. TLS terminates
//! on :443 with certificates resolved per SNI name by the ACME manager,
//! whose host policy mirrors the live route tables exactly. Plain HTTP on
//! :80 answers ACME challenges and redirects everything else to HTTPS
//! (or serves the full pipeline when TLS is disabled).

use crate::acme::{AcmeManager, Http01Challenges, HostPolicy};
use crate::config::ConfigEvent;
use crate::error::{forbidden, not_found, text_response};
use crate::factory::HandlerFactory;
use crate::handler::{
    boxed_request, replace_request_path, split_host_path, HttpRequest, HttpResponse, RouteHandler,
};
use crate::mux::Mux;
use crate::rewrite;
use anyhow::Context;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, HOST, LOCATION};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Server settings assembled from the command line
pub struct ServerConfig {
    /// Directory for the ACME certificate cache
    pub certs_dir: PathBuf,
    /// Serve the mux on :80 without TLS
    pub no_cert: bool,
    /// Offer h2 over ALPN (off by default so HTTP/1-only upstreams work)
    pub enable_http2: bool,
    /// Request header names stripped before dispatch
    pub discard_headers: Vec<String>,
    /// Headers added to both the upstream request and the response
    pub extra_headers: Vec<(String, String)>,
    /// FastCGI address for php targets
    pub php_addr: Option<String>,
}

/// Virtual-host multiplexer and serving loop
pub struct Server {
    proxies: RwLock<HashMap<String, Arc<Mux>>>,
    factory: HandlerFactory,
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let factory = HandlerFactory::new(config.php_addr.as_deref());
        Arc::new(Self {
            proxies: RwLock::new(HashMap::new()),
            factory,
            config,
        })
    }

    /// Apply a batch of route events in order
    pub fn process(&self, events: impl IntoIterator<Item = ConfigEvent>) {
        for event in events {
            self.process_event(event);
        }
    }

    /// Consume config-event batches until every producer hangs up
    pub async fn listen(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<ConfigEvent>>) {
        while let Some(batch) = rx.recv().await {
            self.process(batch);
        }
    }

    fn process_event(&self, event: ConfigEvent) {
        info!(event = %event, "route event");
        let (host, path) = split_host_path(&event.entry.hostname);

        if !event.up {
            let mut proxies = self.proxies.write();
            if let Some(mux) = proxies.get(host) {
                mux.remove(path, event.entry.target.as_str());
                // the ACME host policy mirrors this map; a host with no
                // handlers left must stop validating
                if mux.is_empty() {
                    proxies.remove(host);
                }
            }
            return;
        }

        let handler = match self.factory.handler(&event.entry.hostname, &event.entry.target) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(event = %event, error = %e, "failed to build handler");
                return;
            }
        };

        let mux = {
            let mut proxies = self.proxies.write();
            Arc::clone(
                proxies
                    .entry(host.to_string())
                    .or_insert_with(|| Arc::new(Mux::new())),
            )
        };
        mux.add(path, handler, event.entry.target.as_str());
    }

    /// ACME host policy: a certificate may be issued for `host` iff the mux
    /// currently routes it
    pub fn validate_host(&self, host: &str) -> bool {
        self.proxies.read().contains_key(host)
    }

    fn lookup(&self, host: &str, path: &str) -> Result<Arc<dyn RouteHandler>, HttpResponse> {
        let mux = self
            .proxies
            .read()
            .get(host)
            .cloned()
            .ok_or_else(|| forbidden(format!("Unknown hostname in request: {}", host)))?;
        mux.handler(path)
            .ok_or_else(|| forbidden(format!("Cannot serve path: {}", path)))
    }

    /// Dispatch one request through the mux, applying the header policy
    pub async fn handle_request(&self, mut req: HttpRequest, remote_addr: SocketAddr) -> HttpResponse {
        let started = Instant::now();
        let raw_host = raw_request_host(&req).unwrap_or_default();
        let host = normalize_host(&raw_host);
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let resp = match self.lookup(&host, &path) {
            Err(resp) => resp,
            Ok(handler) => {
                self.update_request_headers(&mut req, &raw_host, remote_addr);
                let mut resp = handler.handle(req).await;
                for (name, value) in &self.config.extra_headers {
                    append_header(resp.headers_mut(), name, value);
                }
                resp
            }
        };

        info!(
            method = %method,
            host = %host,
            path = %path,
            peer = %remote_addr,
            status = resp.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request"
        );
        resp
    }

    fn update_request_headers(&self, req: &mut HttpRequest, raw_host: &str, remote_addr: SocketAddr) {
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(raw_host) {
            headers.insert("x-forwarded-host", value);
        }
        if let Ok(value) = HeaderValue::from_str(&remote_addr.to_string()) {
            headers.insert("x-razvhost-remoteaddr", value);
        }
        for name in &self.config.discard_headers {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.remove(name);
            }
        }
        for (name, value) in &self.config.extra_headers {
            append_header(headers, name, value);
        }
    }

    /// Run the listeners until one of them fails; bind errors are fatal
    pub async fn serve(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.config.no_cert {
            return self.serve_mux(80).await;
        }

        let policy: HostPolicy = {
            let server = Arc::downgrade(self);
            Arc::new(move |host: &str| {
                server
                    .upgrade()
                    .map(|s| s.validate_host(host))
                    .unwrap_or(false)
            })
        };
        let manager = AcmeManager::new(self.config.certs_dir.clone(), policy);
        manager.load_cached_certs();
        tokio::spawn(Arc::clone(&manager).run_renewals());

        let challenges = manager.challenges();
        let http = tokio::spawn(serve_acme_http(challenges));
        let tls_server = Arc::clone(self);
        let tls = tokio::spawn(async move { tls_server.serve_tls(manager).await });

        let result = tokio::select! {
            r = http => r,
            r = tls => r,
        };
        result.context("listener task panicked")?
    }

    /// Serve the full pipeline over plain HTTP (TLS disabled)
    async fn serve_mux(self: &Arc<Self>, port: u16) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind :{}", port))?;
        info!(port, "HTTP listener ready (TLS disabled)");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(self);
                    tokio::spawn(async move { server.handle_connection(stream, peer).await });
                }
                Err(e) => error!(error = %e, "failed to accept connection"),
            }
        }
    }

    async fn serve_tls(self: Arc<Self>, manager: Arc<AcmeManager>) -> anyhow::Result<()> {
        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(manager.resolver());
        tls_config.alpn_protocols = if self.config.enable_http2 {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind(("0.0.0.0", 443))
            .await
            .context("failed to bind :443")?;
        info!("HTTPS listener ready");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => server.handle_connection(tls_stream, peer).await,
                            Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                        }
                    });
                }
                Err(e) => error!(error = %e, "failed to accept connection"),
            }
        }
    }

    async fn handle_connection<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let server = self;
        let service = service_fn(move |req: Request<Incoming>| {
            let server = Arc::clone(&server);
            async move {
                Ok::<_, Infallible>(server.handle_request(boxed_request(req), peer).await)
            }
        });

        if let Err(e) = AutoBuilder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
        {
            debug!(peer = %peer, error = %e, "connection error");
        }
    }

    /// Debug interface: `/<host>/<path>` serves what `Host: <host>` would,
    /// with links rewritten so they resolve under `/<host>/`. Bind this to
    /// loopback only.
    pub async fn serve_debug(self: Arc<Self>, addr: String) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind debug interface on {}", addr))?;
        info!(addr, "debug interface listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let inner = Arc::clone(&server);
                        let service = service_fn(move |req: Request<Incoming>| {
                            let server = Arc::clone(&inner);
                            async move {
                                Ok::<_, Infallible>(
                                    server.handle_debug_request(boxed_request(req), peer).await,
                                )
                            }
                        });
                        if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                            .serve_connection_with_upgrades(io, service)
                            .await
                        {
                            debug!(peer = %peer, error = %e, "debug connection error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "failed to accept debug connection"),
            }
        }
    }

    /// Rewrite `/<host>/<rest>` into a `Host: <host>` request for `<rest>`
    pub async fn handle_debug_request(&self, mut req: HttpRequest, peer: SocketAddr) -> HttpResponse {
        let path = req.uri().path().to_string();
        let mut segments = path.splitn(3, '/');
        segments.next(); // empty segment before the leading slash
        let Some(host) = segments.next().filter(|h| !h.is_empty()).map(String::from) else {
            return forbidden("Forbidden");
        };
        let rest = segments
            .next()
            .map(|rest| format!("/{}", rest))
            .unwrap_or_else(|| "/".to_string());

        if let Ok(value) = HeaderValue::from_str(&host) {
            req.headers_mut().insert(HOST, value);
        }
        replace_request_path(&mut req, &rest);

        let resp = self.handle_request(req, peer).await;
        rewrite::apply_path_prefix("", &format!("/{}", host), "", resp).await
    }
}

fn append_header(headers: &mut hyper::HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.append(name, value);
    }
}

/// Host as the client sent it, port included
fn raw_request_host(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
}

fn normalize_host(raw: &str) -> String {
    raw.split(':').next().unwrap_or(raw).to_ascii_lowercase()
}

/// Plain-HTTP front: answer ACME challenges, redirect the rest to HTTPS
async fn serve_acme_http(challenges: Http01Challenges) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", 80))
        .await
        .context("failed to bind :80")?;
    info!("HTTP listener ready (ACME challenges, HTTPS redirect)");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let challenges = challenges.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let challenges = challenges.clone();
                        async move {
                            Ok::<_, Infallible>(acme_http_response(&req, &challenges).await)
                        }
                    });
                    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        debug!(peer = %peer, error = %e, "http connection error");
                    }
                });
            }
            Err(e) => error!(error = %e, "failed to accept connection"),
        }
    }
}

async fn acme_http_response(
    req: &Request<Incoming>,
    challenges: &Http01Challenges,
) -> HttpResponse {
    let path = req.uri().path();
    if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
        if let Some(key_auth) = challenges.get(token).await {
            debug!(token, "answering ACME HTTP-01 challenge");
            return text_response(StatusCode::OK, key_auth);
        }
        return not_found("unknown ACME challenge token");
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("localhost");
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}{}", host, path_and_query);

    Response::builder()
        .status(StatusCode::FOUND)
        .header(
            LOCATION,
            HeaderValue::from_str(&location).unwrap_or_else(|_| HeaderValue::from_static("/")),
        )
        .body(crate::handler::full_body("Redirecting to HTTPS"))
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigEntry;
    use crate::handler::empty_body;
    use http_body_util::BodyExt;
    use url::Url;

    fn test_server() -> Arc<Server> {
        Server::new(ServerConfig {
            certs_dir: PathBuf::from("certs"),
            no_cert: true,
            enable_http2: false,
            discard_headers: vec!["x-real-ip".to_string()],
            extra_headers: vec![("Server".to_string(), "razvhost/test".to_string())],
            php_addr: None,
        })
    }

    fn event(hostname: &str, target: &str, up: bool) -> ConfigEvent {
        ConfigEvent {
            entry: ConfigEntry {
                hostname: hostname.to_string(),
                target: Url::parse(target).unwrap(),
            },
            up,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn request(host: &str, path: &str) -> HttpRequest {
        Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(empty_body())
            .unwrap()
    }

    async fn body_string(resp: HttpResponse) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_unknown_hostname_is_403() {
        let server = test_server();
        let resp = server.handle_request(request("ghost.test", "/"), peer()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(body_string(resp).await.contains("Unknown hostname in request"));
    }

    #[tokio::test]
    async fn test_unserved_path_is_403() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server();
        server.process([event(
            "a.test/files",
            &format!("file://{}", dir.path().display()),
            true,
        )]);

        let resp = server.handle_request(request("a.test", "/other"), peer()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(body_string(resp).await.contains("Cannot serve path"));
    }

    #[tokio::test]
    async fn test_host_policy_mirrors_routes() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server();
        let target = format!("file://{}", dir.path().display());

        assert!(!server.validate_host("c.test"));

        server.process([event("c.test", &target, true)]);
        assert!(server.validate_host("c.test"));

        server.process([event("c.test", &target, false)]);
        assert!(!server.validate_host("c.test"));
    }

    #[tokio::test]
    async fn test_down_only_removes_matching_target() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server();
        let target_a = format!("file://{}", dir.path().display());
        let target_b = "http://127.0.0.1:1";

        server.process([
            event("lb.test", &target_a, true),
            event("lb.test", target_b, true),
        ]);
        server.process([event("lb.test", target_b, false)]);
        assert!(server.validate_host("lb.test"));

        server.process([event("lb.test", &target_a, false)]);
        assert!(!server.validate_host("lb.test"));
    }

    #[tokio::test]
    async fn test_factory_failure_leaves_route_unregistered() {
        let server = test_server();
        server.process([event("bad.test", "gopher://nowhere", true)]);
        assert!(!server.validate_host("bad.test"));
        // the matching down event is tolerated as a no-op
        server.process([event("bad.test", "gopher://nowhere", false)]);
        assert!(!server.validate_host("bad.test"));
    }

    #[tokio::test]
    async fn test_extra_headers_added_to_response() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let server = test_server();
        server.process([event(
            "a.test",
            &format!("file://{}", dir.path().display()),
            true,
        )]);

        let resp = server.handle_request(request("a.test", "/f.txt"), peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("server").unwrap(), "razvhost/test");
    }

    #[tokio::test]
    async fn test_host_normalization_strips_port() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let server = test_server();
        server.process([event(
            "a.test",
            &format!("file://{}", dir.path().display()),
            true,
        )]);

        let resp = server
            .handle_request(request("A.test:8443", "/f.txt"), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readd_after_removal_matches_first_add() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let server = test_server();
        let target = format!("file://{}", dir.path().display());

        server.process([event("a.test", &target, true)]);
        server.process([event("a.test", &target, false)]);
        server.process([event("a.test", &target, true)]);

        let resp = server.handle_request(request("a.test", "/f.txt"), peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_debug_interface_rewrites_links() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("page.html"),
            r#"<html><body><a href="/bar">link</a></body></html>"#,
        )
        .unwrap();
        let server = test_server();
        server.process([event(
            "h.test",
            &format!("file://{}", dir.path().display()),
            true,
        )]);

        let req = Request::builder()
            .uri("/h.test/page.html")
            .body(empty_body())
            .unwrap();
        let resp = server.handle_debug_request(req, peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains(r#"href="/h.test/bar""#), "got: {}", body);
    }

    #[tokio::test]
    async fn test_debug_interface_without_host_is_403() {
        let server = test_server();
        let req = Request::builder().uri("/").body(empty_body()).unwrap();
        let resp = server.handle_debug_request(req, peer()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
