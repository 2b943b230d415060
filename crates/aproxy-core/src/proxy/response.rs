//! Responses written back to the player.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt as _, Empty};
use hyper::header::{self, HeaderValue};
use hyper::http::response::Builder;
use hyper::{Response, StatusCode};
use std::convert::Infallible;
use std::io;

pub const SERVER: &str = "aproxy";

/// Audio bytes or nothing. A body error aborts the connection mid-stream.
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| -> io::Error { match never {} })
        .boxed_unsync()
}

fn base(status: StatusCode) -> Builder {
    Response::builder()
        .status(status)
        .header(header::SERVER, SERVER)
        .header(header::CONNECTION, "close")
}

/// Head for audio bytes starting at `first_byte` of a `content_length` byte
/// resource. `Content-Length` counts the bytes from `first_byte` on.
pub fn stream_head(first_byte: u64, content_length: u64, etag: Option<&str>) -> Builder {
    let status = if first_byte == 0 {
        StatusCode::OK
    } else {
        StatusCode::PARTIAL_CONTENT
    };
    let mut builder = base(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CONTENT_LENGTH, content_length.saturating_sub(first_byte));
    if let Some(etag) = etag.and_then(|e| HeaderValue::from_str(e).ok()) {
        builder = builder.header(header::ETAG, etag);
    }
    if first_byte != 0 {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!(
                "bytes {}-{}/{}",
                first_byte,
                content_length.saturating_sub(1),
                content_length
            ),
        );
    }
    builder
}

/// Bodyless response with `status`.
pub fn error(status: StatusCode) -> Response<ProxyBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    resp
}

/// Status for an upstream error code; anything outside 4xx/5xx becomes 500.
pub fn upstream_status(code: u16) -> StatusCode {
    match StatusCode::from_u16(code) {
        Ok(status) if status.is_client_error() || status.is_server_error() => status,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
