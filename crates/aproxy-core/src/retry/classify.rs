//! Classify task errors into retry policy error kinds.

use super::error::TaskError;
use super::policy::ErrorKind;
use crate::upstream::UpstreamError;

/// Classify an unexpected HTTP status. Every status that reaches the lane is
/// retried; statuses with a defined meaning are handled by the task itself.
pub fn classify_http_status(code: u16) -> ErrorKind {
    ErrorKind::Http(code)
}

/// Classify a curl error for retry decisions.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_url_malformed() || e.is_unsupported_protocol() || e.is_bad_function_argument() {
        return ErrorKind::Permanent;
    }
    ErrorKind::Connection
}

/// Classify a task error into an ErrorKind.
pub fn classify(e: &TaskError) -> ErrorKind {
    match e {
        TaskError::Upstream(UpstreamError::Curl(ce)) => classify_curl_error(ce),
        TaskError::Upstream(UpstreamError::Resolver { status }) => classify_http_status(*status),
        TaskError::Upstream(UpstreamError::InvalidResponse(_)) => ErrorKind::Connection,
        TaskError::Http(code) => classify_http_status(*code),
        TaskError::PartialTransfer { .. } => ErrorKind::Connection,
        TaskError::Aborted => ErrorKind::Permanent,
    }
}
