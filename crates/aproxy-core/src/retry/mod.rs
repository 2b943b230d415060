//! Retry and backoff policy for worker lanes.
//!
//! Error classification (timeouts, connection failures, unexpected HTTP
//! statuses) and the quadratic backoff decision live here so both lanes share
//! one policy.

mod classify;
mod error;
mod policy;

pub use classify::{classify, classify_curl_error, classify_http_status};
pub use error::TaskError;
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
