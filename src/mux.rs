//! Route table for a single virtual host
//!
//! Entries are kept longest-prefix-first so the most specific mount wins.
//! Each entry holds a bag of handlers keyed by target id; duplicate targets
//! for the same path load-balance round-robin via an atomic counter.

use crate::handler::{replace_request_path, trim_path_prefix, HttpRequest, HttpResponse, RouteHandler};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Path-prefix router with round-robin load balancing
#[derive(Default)]
pub struct Mux {
    entries: RwLock<Vec<MuxEntry>>,
}

struct MuxEntry {
    path: String,
    handlers: Vec<MuxHandler>,
    next: AtomicUsize,
}

struct MuxHandler {
    handler: Arc<dyn RouteHandler>,
    target_id: String,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a path prefix.
    ///
    /// Re-adding an existing `(path, target_id)` pair rebinds the handler in
    /// place. Paths longer than `/` get a wrapper that strips the matched
    /// prefix before the handler runs.
    pub fn add(&self, path: &str, handler: Arc<dyn RouteHandler>, target_id: &str) {
        let handler: Arc<dyn RouteHandler> = if path.len() > 1 {
            Arc::new(TrimPath {
                prefix: path.to_string(),
                inner: handler,
            })
        } else {
            handler
        };

        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.path == path) {
            entry.add(handler, target_id);
            return;
        }

        let entry = MuxEntry {
            path: path.to_string(),
            handlers: vec![MuxHandler {
                handler,
                target_id: target_id.to_string(),
            }],
            next: AtomicUsize::new(0),
        };

        // keep descending prefix length, insertion order on ties
        let pos = entries
            .iter()
            .position(|other| path.len() > other.path.len())
            .unwrap_or(entries.len());
        entries.insert(pos, entry);
    }

    /// Remove the handler registered under exactly `path` with `target_id`.
    ///
    /// Removing an unknown pair is a no-op. Drained entries are retained;
    /// lookup skips them.
    pub fn remove(&self, path: &str, target_id: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.path == path) {
            entry.handlers.retain(|h| h.target_id != target_id);
        }
    }

    /// Find a handler for a request path.
    ///
    /// Entries are scanned longest-prefix-first; within the matching entry
    /// the pick rotates over the handler bag.
    pub fn handler(&self, request_path: &str) -> Option<Arc<dyn RouteHandler>> {
        let entries = self.entries.read();
        for entry in entries.iter() {
            if request_path.starts_with(&entry.path) {
                if let Some(handler) = entry.pick() {
                    return Some(handler);
                }
            }
        }
        None
    }

    /// Whether the mux holds no handlers at all
    pub fn is_empty(&self) -> bool {
        self.entries.read().iter().all(|e| e.handlers.is_empty())
    }

    /// Total number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.entries.read().iter().map(|e| e.handlers.len()).sum()
    }
}

impl MuxEntry {
    fn add(&mut self, handler: Arc<dyn RouteHandler>, target_id: &str) {
        if let Some(existing) = self.handlers.iter_mut().find(|h| h.target_id == target_id) {
            existing.handler = handler;
            return;
        }
        self.handlers.push(MuxHandler {
            handler,
            target_id: target_id.to_string(),
        });
    }

    fn pick(&self) -> Option<Arc<dyn RouteHandler>> {
        let count = self.handlers.len();
        if count == 0 {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % count;
        Some(Arc::clone(&self.handlers[idx].handler))
    }
}

/// Strips the matched route prefix from the request path before delegating
struct TrimPath {
    prefix: String,
    inner: Arc<dyn RouteHandler>,
}

#[async_trait]
impl RouteHandler for TrimPath {
    async fn handle(&self, mut req: HttpRequest) -> HttpResponse {
        let trimmed = trim_path_prefix(req.uri().path(), &self.prefix);
        if trimmed != req.uri().path() {
            replace_request_path(&mut req, &trimmed);
        }
        self.inner.handle(req).await
    }
}
