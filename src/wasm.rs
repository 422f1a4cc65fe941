//! WebAssembly bundle backend
//!
//! Serves a fixed three-URL surface: the bundled loader page at the mount
//! root, the bundled JS runtime, and the `.wasm` file from disk. Everything
//! else under the mount is 404. The loader references root-absolute URLs;
//! the path-prefix rewriter hoists them under the mount sub-path.

use crate::error::{internal_error, not_found};
use crate::handler::{full_body, HttpRequest, HttpResponse, RouteHandler};
use async_trait::async_trait;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::path::PathBuf;

const LOADER_HTML: &str = include_str!("../assets/go-wasm.html");
const RUNTIME_JS: &str = include_str!("../assets/go-wasm.js");

pub struct GoWasmHandler {
    wasm_file: PathBuf,
}

impl GoWasmHandler {
    pub fn new(wasm_file: impl Into<PathBuf>) -> Self {
        Self {
            wasm_file: wasm_file.into(),
        }
    }
}

#[async_trait]
impl RouteHandler for GoWasmHandler {
    async fn handle(&self, req: HttpRequest) -> HttpResponse {
        match req.uri().path() {
            "/" => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/html; charset=utf-8")
                .body(full_body(LOADER_HTML))
                .expect("valid response builder"),
            "/go-wasm.js" => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/javascript")
                .body(full_body(RUNTIME_JS))
                .expect("valid response builder"),
            "/main.wasm" => match tokio::fs::read(&self.wasm_file).await {
                Ok(bytes) => Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, "application/wasm")
                    .body(full_body(bytes))
                    .expect("valid response builder"),
                Err(e) => internal_error(format!(
                    "failed to read {}: {}",
                    self.wasm_file.display(),
                    e
                )),
            },
            _ => not_found("Not found"),
        }
    }
}
