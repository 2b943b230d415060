//! What a player asked for, read from a hyper request.

use hyper::header::{self, HeaderMap};
use hyper::{Method, Request};

pub const PARAM_STREAM_URL: &str = "streamUrl";
pub const PARAM_NEXT_STREAM_URL: &str = "nextStreamUrl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub head_only: bool,
    pub stream_url: Option<String>,
    pub next_stream_url: Option<String>,
    /// First byte of the `Range` header, 0 when absent or unsupported.
    pub first_byte: u64,
    pub user_agent: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("only GET/HEAD is supported, got: {0}")]
    UnsupportedMethod(Method),
}

impl ProxyRequest {
    pub fn from_request<B>(req: &Request<B>) -> Result<ProxyRequest, RequestError> {
        let head_only = match *req.method() {
            Method::GET => false,
            Method::HEAD => true,
            ref other => return Err(RequestError::UnsupportedMethod(other.clone())),
        };
        let (stream_url, next_stream_url) = parse_query(req.uri().query().unwrap_or_default());
        let headers = req.headers();
        Ok(ProxyRequest {
            head_only,
            stream_url,
            next_stream_url,
            first_byte: header_str(headers, header::RANGE).map_or(0, first_requested_byte),
            user_agent: header_str(headers, header::USER_AGENT).map(str::to_string),
        })
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `streamUrl` and `nextStreamUrl` from a request query string. Empty values
/// count as absent.
pub fn parse_query(query: &str) -> (Option<String>, Option<String>) {
    let mut stream = None;
    let mut next = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == PARAM_STREAM_URL && stream.is_none() {
            stream = Some(value.into_owned());
        } else if key == PARAM_NEXT_STREAM_URL && next.is_none() {
            next = Some(value.into_owned());
        }
    }
    (stream.filter(|s| !s.is_empty()), next.filter(|s| !s.is_empty()))
}

/// Start offset of a `bytes=<start>-[<end>]` header value. End offsets are
/// ignored; suffix ranges and anything unparsable yield 0.
pub fn first_requested_byte(range: &str) -> u64 {
    let Some(set) = range.trim().strip_prefix("bytes=") else {
        return 0;
    };
    let first = set.split(',').next().unwrap_or_default();
    if first.starts_with('-') {
        return 0;
    }
    let digits: &str = first
        .split_once('-')
        .map_or(first, |(start, _)| start);
    digits.trim().parse().unwrap_or(0)
}
