//! Log tailer backend
//!
//! Streams a local file as `text/plain`, following appends. `tail` starts at
//! offset 0, `tail-new` at the current end. Only complete lines are emitted,
//! each flushed as its own chunk; a shrinking file resets the offset so
//! rotated logs keep streaming. The poll loop stops as soon as the client
//! disconnects.

use crate::error::internal_error;
use crate::handler::{BoxError, HttpBody, HttpRequest, HttpResponse, RouteHandler};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Where to start reading the tailed file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailWhence {
    Start,
    End,
}

pub struct TailHandler {
    path: PathBuf,
    whence: TailWhence,
}

impl TailHandler {
    pub fn new(path: impl Into<PathBuf>, whence: TailWhence) -> Self {
        Self {
            path: path.into(),
            whence,
        }
    }
}

#[async_trait]
impl RouteHandler for TailHandler {
    async fn handle(&self, _req: HttpRequest) -> HttpResponse {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) => return internal_error(format!("{}: {}", self.path.display(), e)),
        };
        let pos = match self.whence {
            TailWhence::Start => 0,
            TailWhence::End => size,
        };

        let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, BoxError>>(16);
        tokio::spawn(follow(self.path.clone(), pos, tx));

        let body: HttpBody = StreamBody::new(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
        .boxed();

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .expect("valid response builder")
    }
}

async fn follow(path: PathBuf, mut pos: u64, tx: mpsc::Sender<Result<Frame<Bytes>, BoxError>>) {
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };
        if len < pos {
            // truncated or rotated in place
            pos = 0;
            carry.clear();
        }

        if len > pos {
            match read_chunk(&path, pos, len - pos).await {
                Ok(data) => {
                    pos += data.len() as u64;
                    carry.extend_from_slice(&data);
                    if let Some(cut) = carry.iter().rposition(|&b| b == b'\n') {
                        let lines: Vec<u8> = carry.drain(..=cut).collect();
                        if tx.send(Ok(Frame::data(Bytes::from(lines)))).await.is_err() {
                            return; // client disconnected
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            }
        }

        tokio::select! {
            _ = tx.closed() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn read_chunk(path: &PathBuf, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len.min(1024 * 1024) as usize);
    file.take(len).read_to_end(&mut buf).await?;
    Ok(buf)
}
