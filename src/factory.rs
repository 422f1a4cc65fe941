//! Handler factory
//!
//! Compiles `(hostname[/path], target URL)` pairs into ready route handlers.
//! The target scheme selects the backend kind; every handler is wrapped in
//! the path-combinator so mounts below a sub-path behave as if they owned it.

use crate::fileserver::{Directory, FileServer};
use crate::handler::{split_host_path, PathCombinator, RouteHandler};
use crate::php::PhpServer;
use crate::redirect::RedirectHandler;
use crate::sftp::SftpFs;
use crate::tail::{TailHandler, TailWhence};
use crate::upstream::{build_client, ProxyHandler, SharedClient};
use crate::wasm::GoWasmHandler;
use crate::s3::S3Fs;
use anyhow::bail;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use url::Url;

pub struct HandlerFactory {
    php: Option<Arc<PhpServer>>,
    client: SharedClient,
}

impl HandlerFactory {
    pub fn new(php_addr: Option<&str>) -> Self {
        let php = php_addr.and_then(|addr| match Url::parse(addr) {
            Ok(url) => Some(Arc::new(PhpServer::new(&url))),
            Err(e) => {
                warn!(addr, error = %e, "invalid PHP CGI address, php targets disabled");
                None
            }
        });
        Self {
            php,
            client: build_client(),
        }
    }

    /// Compile a route target into a handler
    pub fn handler(&self, hostname: &str, target: &Url) -> anyhow::Result<Arc<dyn RouteHandler>> {
        let (host, host_path) = split_host_path(hostname);

        // `rewrite_host` feeds the HTML rewriter; `target_path` is the
        // absolute path the upstream believes it is serving under
        let (inner, rewrite_host, target_path): (Arc<dyn RouteHandler>, &str, String) =
            match target.scheme() {
                "file" => (new_file_server(&target_file_path(target)), host, String::new()),
                "http" | "https" => (
                    Arc::new(ProxyHandler::new(target.clone(), self.client.clone())),
                    host,
                    target.path().to_string(),
                ),
                "redirect" => (
                    Arc::new(RedirectHandler::new(target.clone())),
                    "",
                    String::new(),
                ),
                "s3" => (
                    Arc::new(FileServer::new(Arc::new(S3Fs::from_target(target)?))),
                    host,
                    String::new(),
                ),
                "sftp" => (
                    Arc::new(FileServer::new(Arc::new(SftpFs::from_target(target)?))),
                    host,
                    String::new(),
                ),
                "php" => {
                    let Some(php) = &self.php else {
                        bail!("PHP not configured");
                    };
                    let (handler, target_path) = php.handler(&target_file_path(target))?;
                    (Arc::new(handler), host, target_path)
                }
                "go-wasm" => (
                    Arc::new(GoWasmHandler::new(target_file_path(target))),
                    host,
                    String::new(),
                ),
                "tail" => (
                    Arc::new(TailHandler::new(target_file_path(target), TailWhence::Start)),
                    host,
                    String::new(),
                ),
                "tail-new" => (
                    Arc::new(TailHandler::new(target_file_path(target), TailWhence::End)),
                    host,
                    String::new(),
                ),
                scheme => bail!("unknown target URL scheme: {}", scheme),
            };

        Ok(Arc::new(PathCombinator::new(
            rewrite_host,
            host_path,
            &target_path,
            inner,
        )))
    }
}

/// Filesystem path carried by a target URL (`host` and `path` concatenated,
/// so both `file:///abs/path` and `file://relative/path` work)
fn target_file_path(target: &Url) -> String {
    format!("{}{}", target.host_str().unwrap_or_default(), target.path())
}

fn new_file_server(root: &str) -> Arc<dyn RouteHandler> {
    // a root naming a single file serves that file for every request path
    if let Ok(meta) = std::fs::metadata(root) {
        if !meta.is_dir() {
            let path = Path::new(root);
            let parent = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| std::path::PathBuf::from("/"));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Arc::new(FileServer::single_file(
                Arc::new(Directory::new(parent)),
                format!("/{}", name),
            ));
        }
    }
    Arc::new(FileServer::new(Arc::new(Directory::new(root))))
}
