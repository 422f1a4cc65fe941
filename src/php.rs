//! FastCGI backend for PHP applications
//!
//! The configured endpoint is either a single PHP file (every request runs
//! that script) or a directory root (the request path selects the script
//! under it). One FastCGI connection is opened per request against the
//! address given with `--php-addr`; the scheme selects the network
//! (`unix:///run/php-fpm.sock` or `tcp://127.0.0.1:9000`).

use crate::error::internal_error;
use crate::handler::{full_body, HttpRequest, HttpResponse, RouteHandler};
use async_trait::async_trait;
use fastcgi_client::{Client, Params, Request as FcgiRequest};
use http_body_util::BodyExt;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::warn;
use url::Url;

/// FastCGI server address, network selected by the URL scheme
pub enum FcgiAddress {
    Tcp(String),
    Unix(PathBuf),
}

/// Shared FastCGI configuration, one per process
pub struct PhpServer {
    address: Arc<FcgiAddress>,
}

impl PhpServer {
    pub fn new(addr: &Url) -> Self {
        let address = match addr.scheme() {
            "unix" => FcgiAddress::Unix(PathBuf::from(if addr.host_str().is_some() {
                format!("{}{}", addr.host_str().unwrap_or_default(), addr.path())
            } else {
                addr.path().to_string()
            })),
            _ => {
                let host = addr.host_str().unwrap_or_default();
                let target = match addr.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None if host.is_empty() => addr.path().to_string(),
                    None => host.to_string(),
                };
                FcgiAddress::Tcp(target)
            }
        };
        Self {
            address: Arc::new(address),
        }
    }

    /// Compile a handler for a PHP endpoint.
    ///
    /// Returns the handler and the filesystem path the upstream sees, used
    /// by the path-prefix rewriter.
    pub fn handler(&self, endpoint: &str) -> anyhow::Result<(PhpHandler, String)> {
        let meta = std::fs::metadata(endpoint)
            .map_err(|e| anyhow::anyhow!("php endpoint {:?}: {}", endpoint, e))?;
        let endpoint = absolute_path(Path::new(endpoint))?;

        let (docroot, script, target_path) = if meta.is_dir() {
            (endpoint.clone(), None, endpoint)
        } else {
            let docroot = endpoint
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));
            (docroot.clone(), Some(endpoint), docroot)
        };

        Ok((
            PhpHandler {
                address: Arc::clone(&self.address),
                docroot,
                script,
            },
            target_path.to_string_lossy().into_owned(),
        ))
    }
}

fn absolute_path(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

pub struct PhpHandler {
    address: Arc<FcgiAddress>,
    docroot: PathBuf,
    script: Option<PathBuf>,
}

#[async_trait]
impl RouteHandler for PhpHandler {
    async fn handle(&self, req: HttpRequest) -> HttpResponse {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return internal_error(format!("failed to read request body: {}", e)),
        };

        let script = match &self.script {
            Some(script) => script.clone(),
            None => self.docroot.join(parts.uri.path().trim_start_matches('/')),
        };

        let request_uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let remote: Option<SocketAddr> = parts
            .headers
            .get("x-razvhost-remoteaddr")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut params = Params::default()
            .request_method(parts.method.as_str().to_string())
            .script_name(parts.uri.path().to_string())
            .script_filename(script.to_string_lossy().into_owned())
            .document_uri(parts.uri.path().to_string())
            .document_root(self.docroot.to_string_lossy().into_owned())
            .request_uri(request_uri)
            .query_string(parts.uri.query().unwrap_or_default().to_string())
            .content_type(content_type)
            .content_length(body.len());
        if let Some(remote) = remote {
            params = params
                .remote_addr(remote.ip().to_string())
                .remote_port(remote.port());
        }

        let stdout = match self.address.as_ref() {
            FcgiAddress::Tcp(addr) => match TcpStream::connect(addr).await {
                Ok(stream) => execute(stream, params, &body).await,
                Err(e) => {
                    warn!(addr = %addr, error = %e, "fastcgi connect failed");
                    return internal_error(format!("fastcgi connect failed: {}", e));
                }
            },
            #[cfg(unix)]
            FcgiAddress::Unix(path) => match tokio::net::UnixStream::connect(path).await {
                Ok(stream) => execute(stream, params, &body).await,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "fastcgi connect failed");
                    return internal_error(format!("fastcgi connect failed: {}", e));
                }
            },
            #[cfg(not(unix))]
            FcgiAddress::Unix(_) => {
                return internal_error("unix fastcgi sockets are not supported on this platform");
            }
        };

        match stdout {
            Ok(raw) => parse_cgi_response(&raw),
            Err(e) => internal_error(format!("fastcgi request failed: {}", e)),
        }
    }
}

async fn execute<S>(stream: S, params: Params<'_>, body: &[u8]) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client = Client::new(stream);
    let output = client.execute_once(FcgiRequest::new(params, body)).await?;
    Ok(output.stdout.unwrap_or_default())
}

/// Turn a CGI stdout blob (header block, blank line, body) into a response
fn parse_cgi_response(raw: &[u8]) -> HttpResponse {
    let (head, body) = match find_head_end(raw) {
        Some((head_len, body_start)) => (&raw[..head_len], &raw[body_start..]),
        None => (&[][..], raw),
    };

    let mut status = StatusCode::OK;
    let mut builder = Response::builder();
    for line in head.split(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("status") {
            status = value
                .split_whitespace()
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);
        } else {
            builder = builder.header(name, value);
        }
    }

    builder
        .status(status)
        .body(full_body(body.to_vec()))
        .unwrap_or_else(|e| internal_error(format!("bad CGI response: {}", e)))
}

fn find_head_end(raw: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    raw.windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, pos + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_from_unix_url() {
        let server = PhpServer::new(&Url::parse("unix:///var/run/php/php-fpm.sock").unwrap());
        match server.address.as_ref() {
            FcgiAddress::Unix(path) => {
                assert_eq!(path, &PathBuf::from("/var/run/php/php-fpm.sock"))
            }
            _ => panic!("expected unix address"),
        }
    }

    #[test]
    fn test_address_from_tcp_url() {
        let server = PhpServer::new(&Url::parse("tcp://127.0.0.1:9000").unwrap());
        match server.address.as_ref() {
            FcgiAddress::Tcp(addr) => assert_eq!(addr, "127.0.0.1:9000"),
            _ => panic!("expected tcp address"),
        }
    }

    #[test]
    fn test_handler_requires_existing_endpoint() {
        let server = PhpServer::new(&Url::parse("tcp://127.0.0.1:9000").unwrap());
        assert!(server.handler("/definitely/not/here.php").is_err());
    }

    #[test]
    fn test_handler_file_vs_directory_target_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.php");
        std::fs::write(&file, "<?php ?>").unwrap();

        let server = PhpServer::new(&Url::parse("tcp://127.0.0.1:9000").unwrap());

        let (handler, target_path) = server.handler(file.to_str().unwrap()).unwrap();
        assert!(handler.script.is_some());
        assert_eq!(target_path, dir.path().to_string_lossy());

        let (handler, target_path) = server.handler(dir.path().to_str().unwrap()).unwrap();
        assert!(handler.script.is_none());
        assert_eq!(target_path, dir.path().to_string_lossy());
    }

    #[tokio::test]
    async fn test_parse_cgi_response() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/html\r\nX-Extra: 1\r\n\r\nmissing";
        let resp = parse_cgi_response(raw);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "text/html");
        assert_eq!(resp.headers().get("x-extra").unwrap(), "1");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"missing");
    }

    #[tokio::test]
    async fn test_parse_cgi_response_defaults_to_200() {
        let raw = b"Content-Type: text/plain\n\nhello";
        let resp = parse_cgi_response(raw);
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
    }
}
