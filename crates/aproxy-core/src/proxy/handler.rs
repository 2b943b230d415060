//! One player request: answer from the completed file when there is one,
//! otherwise stream chunks as the loader delivers them.

use super::request::{ProxyRequest, PARAM_STREAM_URL};
use super::response::{self, empty_body, stream_head, ProxyBody};
use super::ProxyShared;
use crate::chunk::ByteRange;
use crate::future::{FutureError, StreamFuture};
use crate::loader::LoaderError;
use bytes::Bytes;
use http_body_util::{BodyExt as _, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const FILE_BUFFER: usize = 64 * 1024;
/// Frames buffered between the producer task and hyper.
const BODY_FRAMES: usize = 4;

type FrameSender = mpsc::Sender<Result<Frame<Bytes>, io::Error>>;

/// `service_fn` target for one request.
pub(super) async fn handle(
    req: Request<Incoming>,
    peer: SocketAddr,
    shared: Arc<ProxyShared>,
) -> Result<Response<ProxyBody>, Infallible> {
    let request = match ProxyRequest::from_request(&req) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(%peer, "rejecting request: {}", e);
            return Ok(response::error(StatusCode::METHOD_NOT_ALLOWED));
        }
    };
    tracing::debug!(
        %peer,
        url = ?request.stream_url,
        first_byte = request.first_byte,
        user_agent = ?request.user_agent,
        "proxy request"
    );
    let Some(url) = request.stream_url.clone() else {
        tracing::warn!(%peer, "missing {} parameter", PARAM_STREAM_URL);
        return Ok(response::error(StatusCode::BAD_REQUEST));
    };

    if let Some(path) = shared.loader.store().complete_file(&url) {
        match serve_complete_file(&request, &url, &path, &shared).await {
            Ok(resp) => return Ok(resp),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Purged under us; forget the record and stream from chunks.
                tracing::debug!(url = %url, "completed file vanished: {}", e);
                shared.loader.store().remove_metadata(&url);
            }
            Err(e) => {
                tracing::warn!(url = %url, "could not serve completed file: {}", e);
                return Ok(response::error(StatusCode::INTERNAL_SERVER_ERROR));
            }
        }
    }
    Ok(serve_chunks(request, url, shared).await)
}

async fn serve_complete_file(
    request: &ProxyRequest,
    url: &str,
    path: &Path,
    shared: &Arc<ProxyShared>,
) -> io::Result<Response<ProxyBody>> {
    tracing::debug!(url, path = %path.display(), "streaming complete file");
    let mut file = tokio::fs::File::open(path).await?;
    let length = file.metadata().await?.len();
    let offset = request.first_byte;
    if offset >= length && length > 0 {
        return Ok(response::error(StatusCode::RANGE_NOT_SATISFIABLE));
    }

    let etag = shared.loader.store().get_metadata(url).record().etag.clone();
    let head = stream_head(offset, length, etag.as_deref());
    if request.head_only {
        return Ok(with_body(head, empty_body()));
    }

    if !shared.loader.log_playcount(url) {
        tracing::warn!(url, "could not queue playcount log");
    }
    queue_next(request, shared, Duration::ZERO);
    let store = shared.loader.store().clone();
    let touched = url.to_string();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = store.touch(&touched) {
            tracing::warn!(url = %touched, "could not touch completed file: {:#}", e);
        }
    });

    file.seek(io::SeekFrom::Start(offset)).await?;
    let (tx, body) = channel_body();
    let shared = Arc::clone(shared);
    let path: PathBuf = path.to_path_buf();
    tokio::spawn(async move {
        copy_file(file, length - offset, &tx, &shared, &path).await;
    });
    Ok(with_body(head, body))
}

async fn copy_file(
    mut file: tokio::fs::File,
    mut remaining: u64,
    tx: &FrameSender,
    shared: &ProxyShared,
    path: &Path,
) {
    let mut buf = vec![0u8; FILE_BUFFER];
    while remaining > 0 && shared.is_running() {
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(path = %path.display(), "reading completed file failed: {}", e);
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        if !send(tx, Bytes::copy_from_slice(&buf[..n])).await {
            return;
        }
        remaining = remaining.saturating_sub(n as u64);
    }
}

async fn serve_chunks(request: ProxyRequest, url: String, shared: Arc<ProxyShared>) -> Response<ProxyBody> {
    let loader = &shared.loader;
    let start = request.first_byte;

    let known = loader.store().get_metadata(&url).content_length();
    if known > 0 && start >= known {
        return response::error(StatusCode::RANGE_NOT_SATISFIABLE);
    }

    let future = match next_range(&shared, &url, start).await {
        Ok(future) => future,
        Err(status) => return response::error(status),
    };
    let data = match future.get(shared.initial_timeout).await {
        Ok(data) => data,
        Err(FutureError::Timeout) => {
            // The fetch keeps running; the player reconnects.
            tracing::debug!(url = %url, start, "timeout getting first chunk");
            return response::error(StatusCode::SERVICE_UNAVAILABLE);
        }
        Err(FutureError::Canceled) => {
            tracing::debug!(url = %url, start, "first chunk canceled");
            return response::error(response::upstream_status(future.item().record().http_error));
        }
    };

    let (length, etag) = {
        let record = future.item().record();
        (record.content_length, record.etag.clone())
    };
    if length == 0 {
        tracing::warn!(url = %url, "content length unknown after fetch");
        return response::error(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let head = stream_head(start, length, etag.as_deref());
    // Data for this item arrived, the next one may start loading.
    queue_next(&request, &shared, shared.next_preload_delay);
    if request.head_only {
        return with_body(head, empty_body());
    }

    let (tx, body) = channel_body();
    tokio::spawn(async move {
        stream_chunks(&url, start + data.len() as u64, length, data, &tx, &shared).await;
    });
    with_body(head, body)
}

/// Feed `first` and then every following chunk into the body until the end
/// of the content, a failure, or shutdown.
async fn stream_chunks(
    url: &str,
    mut offset: u64,
    length: u64,
    first: Vec<u8>,
    tx: &FrameSender,
    shared: &ProxyShared,
) {
    if first.is_empty() || !send(tx, Bytes::from(first)).await {
        return;
    }
    while offset < length && shared.is_running() {
        let future = match next_range(shared, url, offset).await {
            Ok(future) => future,
            Err(status) => {
                abort(tx, io::ErrorKind::Other, format!("loader refused offset {}: {}", offset, status)).await;
                return;
            }
        };
        let data = match future.get(shared.transfer_timeout).await {
            Ok(data) if !data.is_empty() => data,
            Ok(_) => break,
            Err(FutureError::Timeout) => {
                tracing::debug!(url, offset, "timeout getting data, closing connection");
                abort(tx, io::ErrorKind::TimedOut, format!("no data at offset {}", offset)).await;
                return;
            }
            Err(FutureError::Canceled) => {
                tracing::debug!(url, offset, "request canceled mid-stream");
                abort(tx, io::ErrorKind::Other, format!("canceled at offset {}", offset)).await;
                return;
            }
        };
        offset += data.len() as u64;
        if !send(tx, Bytes::from(data)).await {
            return;
        }
    }
    tracing::debug!(url, offset, length, "reached end of stream");
}

/// Ask the loader for the chunk-sized range at `offset`; failures come back
/// as the status to answer with.
async fn next_range(shared: &ProxyShared, url: &str, offset: u64) -> Result<StreamFuture, StatusCode> {
    let range = ByteRange::new(offset, shared.loader.store().chunk_size());
    shared.loader.request_range(url, range).await.map_err(|e| {
        tracing::debug!(url, offset, "range request failed: {}", e);
        match e {
            LoaderError::Unavailable { status } => response::upstream_status(status),
            LoaderError::OutOfRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            LoaderError::Storage(_) | LoaderError::Closed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    })
}

fn channel_body() -> (FrameSender, ProxyBody) {
    let (tx, rx) = mpsc::channel(BODY_FRAMES);
    (tx, StreamBody::new(ReceiverStream::new(rx)).boxed_unsync())
}

fn with_body(head: hyper::http::response::Builder, body: ProxyBody) -> Response<ProxyBody> {
    head.body(body).unwrap_or_else(|e| {
        tracing::error!("invalid response head: {}", e);
        response::error(StatusCode::INTERNAL_SERVER_ERROR)
    })
}

/// Returns false once the player has gone away.
async fn send(tx: &FrameSender, data: Bytes) -> bool {
    if tx.send(Ok(Frame::data(data))).await.is_err() {
        tracing::debug!("client closed connection [expected]");
        return false;
    }
    true
}

/// End the body with an error so the connection is dropped short of its
/// `Content-Length`.
async fn abort(tx: &FrameSender, kind: io::ErrorKind, msg: String) {
    let _ = tx.send(Err(io::Error::new(kind, msg))).await;
}

fn queue_next(request: &ProxyRequest, shared: &ProxyShared, delay: Duration) {
    if let Some(next) = request.next_stream_url.as_deref() {
        shared.loader.preload(next, delay);
    }
}

/// True for connection errors caused by the player hanging up or by the
/// stream ending early on purpose.
pub(super) fn is_expected_close(e: &hyper::Error) -> bool {
    if e.is_incomplete_message() || e.is_canceled() || e.is_closed() {
        return true;
    }
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            return matches!(
                io.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Other
            );
        }
        source = cause.source();
    }
    false
}
