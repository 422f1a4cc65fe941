//! HTML path-prefix rewriting
//!
//! When a backend is mounted below a sub-path of a public host, its HTML and
//! `Location` redirects refer to its own root. This module translates both so
//! the browser stays inside the hoisted sub-path. HTML bodies are rewritten
//! incrementally: a pump task feeds response chunks to a tokenizer running on
//! a blocking thread, which emits rewritten chunks back into the body stream.
//! Whole bodies are never buffered.

use crate::handler::{single_joining_slash, BoxError, HttpBody, HttpResponse};
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::Response;
use lol_html::{element, HtmlRewriter, Settings};
use tokio::sync::mpsc;
use url::Url;

/// Attributes whose values are subject to URL rewriting
const URL_ATTRIBUTES: [&str; 4] = ["href", "src", "action", "formaction"];

/// Apply the URL rewrite rule to a single value.
///
/// Absolute URLs pointing at a foreign host pass through unchanged; ones
/// pointing at `hostname` are reduced to their request URI first. Root
/// relative values get `target_path` stripped and `host_path` prepended,
/// with exactly one slash at the seam.
pub fn rewrite_url(value: &str, hostname: &str, host_path: &str, target_path: &str) -> String {
    let mut loc = value.to_string();

    let absolute = match Url::parse(value) {
        Ok(u) if u.has_host() => Some(u),
        Ok(_) => None,
        // network-path references ("//host/path") have no scheme to parse
        Err(_) if value.starts_with("//") => {
            Url::parse(&format!("http:{}", value)).ok().filter(Url::has_host)
        }
        Err(_) => None,
    };

    if let Some(u) = absolute {
        let mut authority = u.host_str().unwrap_or("").to_string();
        if let Some(port) = u.port() {
            authority = format!("{}:{}", authority, port);
        }
        if authority != hostname {
            return loc;
        }
        let mut uri = u.path().to_string();
        if let Some(q) = u.query() {
            uri.push('?');
            uri.push_str(q);
        }
        if let Some(f) = u.fragment() {
            uri.push('#');
            uri.push_str(f);
        }
        loc = uri;
    }

    if loc.starts_with('/') && !loc.starts_with("//") {
        let stripped = loc.strip_prefix(target_path).unwrap_or(&loc);
        loc = if stripped.is_empty() {
            if host_path.is_empty() {
                "/".to_string()
            } else {
                host_path.to_string()
            }
        } else if host_path.is_empty() && stripped.starts_with('/') {
            stripped.to_string()
        } else {
            single_joining_slash(host_path, stripped)
        };
    }

    loc
}

/// Wrap a response so that `Location` headers and HTML bodies follow the
/// rewrite rule.
///
/// The `Content-Type` gates body rewriting: only `text/html` responses run
/// through the tokenizer, and their `Content-Length` is dropped since the
/// rewritten length is unknown. Responses without a `Content-Type` get one
/// sniffed from the first body bytes before the gate is applied.
pub async fn apply_path_prefix(
    hostname: &str,
    host_path: &str,
    target_path: &str,
    resp: HttpResponse,
) -> HttpResponse {
    let (mut parts, mut body) = resp.into_parts();

    if let Some(location) = parts
        .headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    {
        let rewritten = rewrite_url(&location, hostname, host_path, target_path);
        if rewritten != location {
            if let Ok(value) = HeaderValue::from_str(&rewritten) {
                parts.headers.insert(LOCATION, value);
            }
        }
    }

    let mut first_frame = None;
    let content_type = match parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    {
        Some(ctype) => ctype,
        None => {
            // the backend never labelled the response; sniff the first bytes
            let frame = body.frame().await;
            let sniffed = match &frame {
                Some(Ok(f)) => f
                    .data_ref()
                    .map(|d| sniff_content_type(d))
                    .unwrap_or("application/octet-stream"),
                _ => "text/plain; charset=utf-8",
            };
            parts
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(sniffed));
            first_frame = frame;
            sniffed.to_string()
        }
    };

    let body: HttpBody = match first_frame {
        Some(frame) => {
            BodyExt::boxed(StreamBody::new(stream::iter([frame]).chain(BodyStream::new(body))))
        }
        None => body,
    };

    if !content_type.starts_with("text/html") {
        return Response::from_parts(parts, body);
    }

    parts.headers.remove(CONTENT_LENGTH);
    let body = rewrite_html_body(
        hostname.to_string(),
        host_path.to_string(),
        target_path.to_string(),
        body,
    );
    Response::from_parts(parts, body)
}

/// Stream an HTML body through the tokenizer, rewriting URL attributes.
///
/// Untouched markup is re-emitted verbatim, so documents that need no
/// rewriting come out byte-identical.
pub fn rewrite_html_body(
    hostname: String,
    host_path: String,
    target_path: String,
    mut body: HttpBody,
) -> HttpBody {
    let (in_tx, in_rx) = std::sync::mpsc::channel::<Bytes>();
    let (out_tx, out_rx) = mpsc::channel::<Result<Frame<Bytes>, BoxError>>(16);

    let sink_tx = out_tx.clone();
    tokio::task::spawn_blocking(move || {
        let emit = sink_tx.clone();
        let handlers = URL_ATTRIBUTES
            .into_iter()
            .map(|attr| {
                let hostname = hostname.clone();
                let host_path = host_path.clone();
                let target_path = target_path.clone();
                element!(format!("[{}]", attr), move |el| {
                    if let Some(value) = el.get_attribute(attr) {
                        let rewritten = rewrite_url(&value, &hostname, &host_path, &target_path);
                        if rewritten != value {
                            el.set_attribute(attr, &rewritten)?;
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: handlers,
                ..Settings::default()
            },
            move |chunk: &[u8]| {
                let _ = emit.blocking_send(Ok(Frame::data(Bytes::copy_from_slice(chunk))));
            },
        );

        while let Ok(chunk) = in_rx.recv() {
            if let Err(e) = rewriter.write(&chunk) {
                let _ = sink_tx.blocking_send(Err(e.to_string().into()));
                return;
            }
        }
        // input drained; flush whatever the tokenizer still buffers
        if let Err(e) = rewriter.end() {
            let _ = sink_tx.blocking_send(Err(e.to_string().into()));
        }
    });

    tokio::spawn(async move {
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        if in_tx.send(data).is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = out_tx.send(Err(e)).await;
                    return;
                }
                None => return, // dropping in_tx lets the tokenizer flush and finish
            }
        }
    });

    let out = stream::unfold(out_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    BodyExt::boxed(StreamBody::new(out))
}

/// Minimal content-type sniffer for unlabelled responses
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    let trimmed = {
        let mut d = data;
        while let Some((first, rest)) = d.split_first() {
            if first.is_ascii_whitespace() {
                d = rest;
            } else {
                break;
            }
        }
        d
    };

    const HTML_PREFIXES: [&str; 10] = [
        "<!DOCTYPE HTML", "<HTML", "<HEAD", "<BODY", "<SCRIPT", "<IFRAME", "<H1", "<DIV", "<P",
        "<TABLE",
    ];
    for prefix in HTML_PREFIXES {
        if trimmed.len() >= prefix.len()
            && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
        {
            return "text/html; charset=utf-8";
        }
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if trimmed.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if trimmed.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if trimmed.starts_with(b"GIF87a") || trimmed.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if trimmed.starts_with(b"\xff\xd8\xff") {
        return "image/jpeg";
    }
    if data.contains(&0) {
        return "application/octet-stream";
    }
    "text/plain; charset=utf-8"
}
