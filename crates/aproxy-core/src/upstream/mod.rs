//! Upstream boundary: resolve a logical URL into an authorized redirect,
//! range-GET bytes from that redirect, and log playbacks.
//!
//! The trait is blocking; async callers run it on `spawn_blocking`.

mod client;
mod headers;

pub use client::CurlUpstream;

use crate::chunk::ByteRange;

/// Metadata returned by a successful resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStream {
    pub redirect_url: String,
    pub content_length: u64,
    /// Quoted ETag as sent by upstream.
    pub etag: Option<String>,
    /// Redirect expiry, unix seconds.
    pub expires: Option<u64>,
    pub bitrate: Option<u32>,
}

/// Status and body of a range GET.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The resolver answered with a non-success status.
    #[error("resolver returned HTTP {status}")]
    Resolver { status: u16 },
    #[error(transparent)]
    Curl(#[from] ::curl::Error),
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Resolver statuses in 400..500 mean the item will never be playable.
    pub fn is_permanent_unavailability(&self) -> bool {
        matches!(self, UpstreamError::Resolver { status } if (400..500).contains(status))
    }
}

/// Network collaborator used by fetch tasks.
pub trait Upstream: Send + Sync {
    /// Turn a logical URL into a redirect plus length/etag/bitrate. Logs a
    /// playback first unless `skip_play_logging` is set.
    fn resolve(&self, url: &str, skip_play_logging: bool) -> Result<ResolvedStream, UpstreamError>;

    /// GET `range` from `redirect_url`.
    fn range_get(&self, redirect_url: &str, range: ByteRange) -> Result<RangeResponse, UpstreamError>;

    /// Record one playback of `url`; returns the HTTP status.
    fn log_playcount(&self, url: &str) -> Result<u16, UpstreamError>;
}

/// Expiry encoded in a redirect URL's `Expires` query parameter.
pub fn redirect_expiry(redirect_url: &str) -> Option<u64> {
    let parsed = url::Url::parse(redirect_url).ok()?;
    let expires = parsed
        .query_pairs()
        .find(|(k, _)| k.eq_ignore_ascii_case("expires"))
        .and_then(|(_, v)| v.parse::<u64>().ok());
    expires
}
