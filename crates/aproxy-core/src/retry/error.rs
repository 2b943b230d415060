//! Fetch task error type for retry classification.

use crate::upstream::UpstreamError;
use std::fmt;

/// Error from one attempt of a resolve, fetch or playcount task.
#[derive(Debug)]
pub enum TaskError {
    /// Upstream client failed (curl error, malformed response, resolver status).
    Upstream(UpstreamError),
    /// Chunk GET answered with an unexpected status.
    Http(u16),
    /// Body shorter or longer than the requested range.
    PartialTransfer { expected: u64, received: u64 },
    /// The worker thread running the task went away.
    Aborted,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Upstream(e) => write!(f, "{}", e),
            TaskError::Http(code) => write!(f, "HTTP {}", code),
            TaskError::PartialTransfer { expected, received } => {
                write!(f, "partial transfer: expected {} bytes, got {}", expected, received)
            }
            TaskError::Aborted => write!(f, "task aborted"),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::Upstream(e) => Some(e),
            TaskError::Http(_) | TaskError::PartialTransfer { .. } | TaskError::Aborted => None,
        }
    }
}

impl From<UpstreamError> for TaskError {
    fn from(e: UpstreamError) -> Self {
        TaskError::Upstream(e)
    }
}
