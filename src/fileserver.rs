//! File serving with directory listings
//!
//! Backends that look like filesystems (local directories, object stores,
//! SFTP servers) implement [`VirtualFs`]; [`FileServer`] turns any of them
//! into a route handler with range requests, `If-Modified-Since` support and
//! an HTML directory listing sorted directories-first.

use crate::error::{internal_error, not_found};
use crate::handler::{empty_body, BoxError, HttpBody, HttpRequest, HttpResponse, RouteHandler};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{
    ACCEPT_RANGES, ALLOW, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, IF_MODIFIED_SINCE,
    LAST_MODIFIED, RANGE,
};
use hyper::{Method, Response, StatusCode};
use minijinja::{context, Environment};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

/// Upper bound on symlink chains while resolving a path
pub const SYMLINK_MAX_DEPTH: usize = 16;

const READ_CHUNK: u64 = 64 * 1024;

/// Errors surfaced by filesystem backends
#[derive(Debug, Error)]
pub enum FsError {
    #[error("file points outside of the root directory")]
    OutsideRoot,
    #[error("symlink max depth exceeded")]
    SymlinkMaxDepth,
    #[error("failed to open: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

/// Metadata for a single file or directory
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

/// Streamed file content
pub type FileStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>>;

/// A read-only filesystem a [`FileServer`] can serve from
#[async_trait]
pub trait VirtualFs: Send + Sync {
    async fn stat(&self, path: &str) -> Result<FileMeta, FsError>;
    async fn read_dir(&self, path: &str) -> Result<Vec<FileMeta>, FsError>;
    /// Stream `length` bytes starting at `offset`
    async fn read(&self, path: &str, offset: u64, length: u64) -> Result<FileStream, FsError>;
}

/// Route handler serving files and directory listings from a [`VirtualFs`]
pub struct FileServer {
    fs: Arc<dyn VirtualFs>,
    fixed_path: Option<String>,
}

impl FileServer {
    pub fn new(fs: Arc<dyn VirtualFs>) -> Self {
        Self {
            fs,
            fixed_path: None,
        }
    }

    /// Serve a single file for every request path
    pub fn single_file(fs: Arc<dyn VirtualFs>, path: impl Into<String>) -> Self {
        Self {
            fs,
            fixed_path: Some(path.into()),
        }
    }
}

#[async_trait]
impl RouteHandler for FileServer {
    async fn handle(&self, req: HttpRequest) -> HttpResponse {
        let path = self
            .fixed_path
            .clone()
            .unwrap_or_else(|| req.uri().path().to_string());
        serve(self.fs.as_ref(), &req, &path).await
    }
}

/// Serve one request against a virtual filesystem
pub async fn serve(fs: &dyn VirtualFs, req: &HttpRequest, path: &str) -> HttpResponse {
    match req.method() {
        &Method::GET | &Method::HEAD => {}
        _ => {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(ALLOW, "GET, HEAD")
                .body(empty_body())
                .expect("valid response builder");
        }
    }

    let uri = clean_path(path);
    let meta = match fs.stat(&uri).await {
        Ok(meta) => meta,
        Err(e) => return fs_error_response(e),
    };

    if meta.is_dir {
        list_directory(fs, &uri).await
    } else {
        serve_file(fs, req, &uri, &meta).await
    }
}

fn fs_error_response(e: FsError) -> HttpResponse {
    match e {
        FsError::NotFound(_) | FsError::OutsideRoot | FsError::SymlinkMaxDepth => {
            not_found(e.to_string())
        }
        FsError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
            not_found(e.to_string())
        }
        other => internal_error(other.to_string()),
    }
}

async fn serve_file(
    fs: &dyn VirtualFs,
    req: &HttpRequest,
    uri: &str,
    meta: &FileMeta,
) -> HttpResponse {
    if let (Some(modified), Some(since)) = (
        meta.modified,
        req.headers()
            .get(IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok()),
    ) {
        let modified_secs = unix_secs(modified);
        if modified_secs <= since.timestamp() {
            let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
            builder = builder.header(LAST_MODIFIED, http_date(modified));
            return builder.body(empty_body()).expect("valid response builder");
        }
    }

    let content_type = mime_guess::from_path(&meta.name)
        .first_or_octet_stream()
        .to_string();
    let mut builder = Response::builder()
        .header(CONTENT_TYPE, content_type)
        .header(ACCEPT_RANGES, "bytes");
    if let Some(modified) = meta.modified {
        builder = builder.header(LAST_MODIFIED, http_date(modified));
    }

    let range = req.headers().get(RANGE).and_then(|v| v.to_str().ok());
    let (status, offset, length) = match range {
        None => (StatusCode::OK, 0, meta.size),
        Some(value) => match parse_range(value, meta.size) {
            Some((start, end)) => {
                builder = builder.header(
                    CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, meta.size),
                );
                (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
            }
            None => {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(CONTENT_RANGE, format!("bytes */{}", meta.size))
                    .body(empty_body())
                    .expect("valid response builder");
            }
        },
    };
    builder = builder.status(status).header(CONTENT_LENGTH, length);

    if *req.method() == Method::HEAD {
        return builder.body(empty_body()).expect("valid response builder");
    }

    match fs.read(uri, offset, length).await {
        Ok(content) => builder
            .body(stream_body(content))
            .expect("valid response builder"),
        Err(e) => fs_error_response(e),
    }
}

fn stream_body(content: FileStream) -> HttpBody {
    BodyExt::boxed(StreamBody::new(content.map(|r| r.map(Frame::data).map_err(BoxError::from))))
}

// --- directory listing ---

#[derive(Serialize)]
struct ListingEntry {
    icon: String,
    name: String,
    full_name: String,
    size: String,
    modified: String,
    created: String,
}

const FILE_ICON: &str = "&#128196;";
const FOLDER_ICON: &str = "&#128194;";

const LISTING_TEMPLATE: &str = r#"<style type="text/css" scoped>
a {
	color: black;
	text-decoration: underline;
	text-decoration-color: rgb(220, 53, 69);
	-webkit-text-decoration-color: rgb(220, 53, 69);
}
a:hover {
	color: dimgrey;
}
table {
	border-collapse: collapse;
	margin-bottom: 1rem;
	border-spacing: 0;
}
td {
	padding: 10px;
	border: 1px solid transparent;
}
tr:nth-child(odd) > td {
	background-color: #F0F0F0;
}
tr:first-child > td {
	font-weight: bold;
	border-bottom: 1px solid black;
	background-color: white;
}
tr:not(:first-child):hover > td {
	background-color: lightsteelblue;
}
</style>
<table>
	<tr>
		<td>Name</td>
		<td>Size</td>
		<td>Modified</td>
		<td>Created</td>
	</tr>
	{% for e in entries %}
	<tr>
		<td>{{ e.icon|safe }} <a href="{{ e.full_name }}">{{ e.name }}</a></td>
		<td>{{ e.size }}</td>
		<td>{{ e.modified }}</td>
		<td>{{ e.created }}</td>
	</tr>
	{% else %}
	<tr>
		<td colspan="4">Empty</td>
	</tr>
	{% endfor %}
</table>
"#;

fn listing_env() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(|| {
        let mut env = Environment::new();
        env.add_template("listing.html", LISTING_TEMPLATE)
            .expect("valid listing template");
        env
    })
}

async fn list_directory(fs: &dyn VirtualFs, uri: &str) -> HttpResponse {
    let mut files = match fs.read_dir(uri).await {
        Ok(files) => files,
        Err(e) => return fs_error_response(e),
    };
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by_key(|f| !f.is_dir);

    let mut entries = Vec::with_capacity(files.len() + 1);
    if uri != "/" {
        entries.push(ListingEntry {
            icon: FOLDER_ICON.to_string(),
            name: "..".to_string(),
            full_name: parent_dir(uri),
            size: String::new(),
            modified: String::new(),
            created: String::new(),
        });
    }
    for meta in &files {
        entries.push(listing_entry(meta, uri));
    }

    let html = match listing_env()
        .get_template("listing.html")
        .and_then(|t| t.render(context! { entries }))
    {
        Ok(html) => html,
        Err(e) => {
            warn!(error = %e, "failed to render directory listing");
            return internal_error("failed to render directory listing");
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(crate::handler::full_body(html))
        .expect("valid response builder")
}

fn listing_entry(meta: &FileMeta, uri: &str) -> ListingEntry {
    ListingEntry {
        icon: if meta.is_dir { FOLDER_ICON } else { FILE_ICON }.to_string(),
        name: meta.name.clone(),
        full_name: join_listing_path(uri, &meta.name),
        size: byte_count_iec(meta.size),
        modified: meta.modified.map(http_date).unwrap_or_default(),
        created: meta
            .created
            .or(meta.modified)
            .map(http_date)
            .unwrap_or_default(),
    }
}

fn join_listing_path(uri: &str, name: &str) -> String {
    if uri == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", uri, name)
    }
}

fn parent_dir(uri: &str) -> String {
    match uri.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => uri[..i].to_string(),
    }
}

// --- helpers ---

/// Lexically normalize a URL path: resolves `.` and `..`, clamps at the root
pub fn clean_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            seg => out.push(seg),
        }
    }
    format!("/{}", out.join("/"))
}

/// Human-readable size in IEC units
pub fn byte_count_iec(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}iB", bytes as f64 / div as f64, ['K', 'M', 'G', 'T', 'P', 'E'][exp])
}

/// RFC 1123 timestamp for `Last-Modified` and the listing columns
pub fn http_date(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn unix_secs(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse a single-range `Range` header against a resource of `size` bytes.
///
/// Returns the inclusive byte range, or `None` when unsatisfiable.
pub fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?.split(',').next()?.trim();
    let (start, end) = spec.split_once('-')?;
    if start.is_empty() {
        // suffix range: last N bytes
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 || size == 0 {
            return None;
        }
        let start = size.saturating_sub(suffix);
        return Some((start, size - 1));
    }
    let start: u64 = start.parse().ok()?;
    if start >= size {
        return None;
    }
    let end: u64 = if end.is_empty() {
        size - 1
    } else {
        end.parse::<u64>().ok()?.min(size - 1)
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

// --- local directory backend ---

/// Local directory with symlink containment.
///
/// Each path resolves iteratively; symlinks are followed up to
/// [`SYMLINK_MAX_DEPTH`] links and the final target must stay under the root.
pub struct Directory {
    root: PathBuf,
}

impl Directory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf, FsError> {
        let root = if self.root.as_os_str().is_empty() {
            Path::new(".")
        } else {
            self.root.as_path()
        };
        let abs_root = lexical_normalize(&absolute(root)?);
        let mut filename = abs_root.join(rel.trim_start_matches('/'));

        let mut depth = 0;
        loop {
            let meta = std::fs::symlink_metadata(&filename)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => FsError::NotFound(rel.to_string()),
                    _ => FsError::Io(e),
                })?;
            if !meta.file_type().is_symlink() {
                let normalized = lexical_normalize(&filename);
                if !normalized.starts_with(&abs_root) {
                    return Err(FsError::OutsideRoot);
                }
                return Ok(normalized);
            }
            let target = std::fs::read_link(&filename)?;
            filename = if target.is_absolute() {
                target
            } else {
                match filename.parent() {
                    Some(parent) => parent.join(&target),
                    None => target,
                }
            };
            depth += 1;
            if depth > SYMLINK_MAX_DEPTH {
                return Err(FsError::SymlinkMaxDepth);
            }
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf, FsError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Resolve `.` and `..` components without touching the filesystem
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[async_trait]
impl VirtualFs for Directory {
    async fn stat(&self, path: &str) -> Result<FileMeta, FsError> {
        let resolved = self.resolve(path)?;
        let meta = std::fs::metadata(&resolved)?;
        Ok(file_meta(&resolved, &meta))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileMeta>, FsError> {
        let resolved = self.resolve(path)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&resolved)? {
            let entry = entry?;
            // entries with unreadable metadata are skipped rather than
            // failing the whole listing
            let Ok(meta) = entry.metadata() else { continue };
            entries.push(file_meta(&entry.path(), &meta));
        }
        Ok(entries)
    }

    async fn read(&self, path: &str, offset: u64, length: u64) -> Result<FileStream, FsError> {
        let resolved = self.resolve(path)?;
        let mut file = tokio::fs::File::open(&resolved).await?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(file_stream(file, length))
    }
}

fn file_meta(path: &Path, meta: &std::fs::Metadata) -> FileMeta {
    FileMeta {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size: meta.len(),
        is_dir: meta.is_dir(),
        modified: meta.modified().ok(),
        created: meta.created().ok(),
    }
}

fn file_stream(file: tokio::fs::File, length: u64) -> FileStream {
    Box::pin(stream::unfold((file, length), |(mut file, remaining)| async move {
        if remaining == 0 {
            return None;
        }
        let mut buf = vec![0u8; remaining.min(READ_CHUNK) as usize];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), (file, remaining - n as u64)))
            }
            Err(e) => Some((Err(e), (file, 0))),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::empty_body;
    use hyper::Request;

    fn get(path: &str) -> HttpRequest {
        Request::builder().uri(path).body(empty_body()).unwrap()
    }

    async fn body_string(resp: HttpResponse) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn test_byte_count_iec() {
        assert_eq!(byte_count_iec(0), "0 B");
        assert_eq!(byte_count_iec(512), "512 B");
        assert_eq!(byte_count_iec(1228), "1.2 KiB");
        assert_eq!(byte_count_iec(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_path("/../../x"), "/x");
        assert_eq!(clean_path("//a//b/"), "/a/b");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), "/");
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse_range("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=-3", 10), Some((7, 9)));
        assert_eq!(parse_range("bytes=5-100", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=10-", 10), None);
        assert_eq!(parse_range("bytes=4-2", 10), None);
        assert_eq!(parse_range("nonsense", 10), None);
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/a/b"), "/a");
        assert_eq!(parent_dir("/a"), "/");
    }

    #[tokio::test]
    async fn test_serve_file_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("zdir")).unwrap();

        let fs = Directory::new(dir.path());

        let resp = serve(&fs, &get("/b.txt"), "/b.txt").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "hello");

        let resp = serve(&fs, &get("/"), "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_string(resp).await;
        // directories sort before files, names lexicographic
        let zdir = html.find("zdir").unwrap();
        let a = html.find("a.txt").unwrap();
        let b = html.find("b.txt").unwrap();
        assert!(zdir < a && a < b, "listing order wrong: {}", html);
        // no parent link at the root
        assert!(!html.contains(">..<"));
    }

    #[tokio::test]
    async fn test_listing_has_parent_link_below_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/f.txt"), "x").unwrap();

        let fs = Directory::new(dir.path());
        let html = body_string(serve(&fs, &get("/sub"), "/sub").await).await;
        assert!(html.contains(r#"<a href="/">..</a>"#), "got: {}", html);
        assert!(html.contains(r#"<a href="/sub/f.txt">f.txt</a>"#), "got: {}", html);
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Directory::new(dir.path());
        let resp = serve(&fs, &get("/nope"), "/nope").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_range_request() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "0123456789").unwrap();
        let fs = Directory::new(dir.path());

        let req = Request::builder()
            .uri("/f.txt")
            .header(RANGE, "bytes=2-5")
            .body(empty_body())
            .unwrap();
        let resp = serve(&fs, &req, "/f.txt").await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            resp.headers().get(CONTENT_RANGE).unwrap(),
            "bytes 2-5/10"
        );
        assert_eq!(body_string(resp).await, "2345");

        let req = Request::builder()
            .uri("/f.txt")
            .header(RANGE, "bytes=99-")
            .body(empty_body())
            .unwrap();
        let resp = serve(&fs, &req, "/f.txt").await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn test_if_modified_since() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let fs = Directory::new(dir.path());

        // a stamp far in the future: not modified since then
        let req = Request::builder()
            .uri("/f.txt")
            .header(IF_MODIFIED_SINCE, "Mon, 01 Jan 2046 00:00:00 GMT")
            .body(empty_body())
            .unwrap();
        let resp = serve(&fs, &req, "/f.txt").await;
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

        let req = Request::builder()
            .uri("/f.txt")
            .header(IF_MODIFIED_SINCE, "Mon, 01 Jan 2001 00:00:00 GMT")
            .body(empty_body())
            .unwrap();
        let resp = serve(&fs, &req, "/f.txt").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_single_file_server() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("only.txt"), "only").unwrap();
        let server = FileServer::single_file(
            Arc::new(Directory::new(dir.path())),
            "/only.txt",
        );
        for path in ["/", "/whatever", "/a/b/c"] {
            let resp = server.handle(get(path)).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_string(resp).await, "only");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_contained() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(
            outer.path().join("secret.txt"),
            root.join("escape.txt"),
        )
        .unwrap();

        let fs = Directory::new(&root);
        match fs.stat("/escape.txt").await {
            Err(FsError::OutsideRoot) => {}
            other => panic!("expected OutsideRoot, got {:?}", other.map(|m| m.name)),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_inside_root_is_served() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real.txt"), "data").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let fs = Directory::new(dir.path());
        let meta = fs.stat("/link.txt").await.unwrap();
        assert!(!meta.is_dir);
        assert_eq!(meta.size, 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_chain_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("end"), "x").unwrap();
        let mut prev = dir.path().join("end");
        for i in 0..17 {
            let link = dir.path().join(format!("link{}", i));
            std::os::unix::fs::symlink(&prev, &link).unwrap();
            prev = link;
        }

        let fs = Directory::new(dir.path());
        match fs.stat("/link16").await {
            Err(FsError::SymlinkMaxDepth) => {}
            other => panic!("expected SymlinkMaxDepth, got {:?}", other.map(|m| m.name)),
        }
    }
}
