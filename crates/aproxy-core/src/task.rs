//! Fetch tasks: one blocking unit of upstream work for one item.
//!
//! Tasks interpret HTTP statuses that carry meaning (403 = redirect expired,
//! 402/404/410 = gone) by updating the item record directly and reporting a
//! `None` outcome; everything else unexpected becomes a retryable error.

use crate::chunk::{ByteRange, ChunkRange};
use crate::item::ItemRef;
use crate::retry::TaskError;
use crate::upstream::{ResolvedStream, Upstream, UpstreamError};
use std::fmt;

#[derive(Clone)]
pub enum Task {
    /// Resolve the item's logical URL into a redirect plus metadata.
    Resolve { item: ItemRef },
    /// Range-GET one chunk from the item's redirect URL.
    Fetch { item: ItemRef, chunk: u32 },
    /// Record one playback of the item.
    LogPlayback { item: ItemRef },
}

#[derive(Debug)]
pub enum TaskOutcome {
    /// `None` when the resolver reported the item as permanently unavailable.
    Resolved(Option<ResolvedStream>),
    /// `None` when the status was handled on the item (expired redirect,
    /// item gone, or no redirect to fetch from).
    Fetched(Option<Vec<u8>>),
    PlayLogged,
}

impl Task {
    pub fn item(&self) -> &ItemRef {
        match self {
            Task::Resolve { item } | Task::Fetch { item, .. } | Task::LogPlayback { item } => item,
        }
    }

    /// Run against `upstream`. Blocking.
    pub fn execute(&self, upstream: &dyn Upstream, chunk_size: u64) -> Result<TaskOutcome, TaskError> {
        match self {
            Task::Resolve { item } => resolve(item, upstream),
            Task::Fetch { item, chunk } => fetch(item, *chunk, upstream, chunk_size),
            Task::LogPlayback { item } => log_playback(item, upstream),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Resolve { item } => write!(f, "Resolve({})", item.url()),
            Task::Fetch { item, chunk } => write!(f, "Fetch({}, chunk {})", item.url(), chunk),
            Task::LogPlayback { item } => write!(f, "LogPlayback({})", item.url()),
        }
    }
}

fn resolve(item: &ItemRef, upstream: &dyn Upstream) -> Result<TaskOutcome, TaskError> {
    match upstream.resolve(item.url(), true) {
        Ok(resolved) => {
            tracing::debug!(url = item.url(), length = resolved.content_length, "resolved");
            Ok(TaskOutcome::Resolved(Some(resolved)))
        }
        Err(e) => {
            if let UpstreamError::Resolver { status } = &e {
                let status = *status;
                if e.is_permanent_unavailability() {
                    tracing::warn!(url = item.url(), status, "item unavailable");
                    item.record().mark_unavailable(status);
                    return Ok(TaskOutcome::Resolved(None));
                }
                item.record().set_http_error(status);
            }
            Err(e.into())
        }
    }
}

fn fetch(
    item: &ItemRef,
    chunk: u32,
    upstream: &dyn Upstream,
    chunk_size: u64,
) -> Result<TaskOutcome, TaskError> {
    let (redirect, content_length) = {
        let record = item.record();
        (record.redirect_url.clone(), record.content_length)
    };
    let Some(redirect) = redirect else {
        tracing::debug!(url = item.url(), chunk, "no redirect to fetch from");
        return Ok(TaskOutcome::Fetched(None));
    };
    let range = ChunkRange::new(chunk, 1).byte_range(chunk_size);
    let expected = if content_length > 0 {
        match range.intersection(&ByteRange::new(0, content_length)) {
            Some(r) => r.length,
            None => return Ok(TaskOutcome::Fetched(None)),
        }
    } else {
        range.length
    };

    let resp = upstream.range_get(&redirect, range)?;
    match resp.status {
        206 => check_length(resp.body, expected).map(|b| TaskOutcome::Fetched(Some(b))),
        200 => {
            // Range ignored: the body is the whole resource.
            let start = range.start as usize;
            let body = match resp.body.get(start..start + expected as usize) {
                Some(slice) => slice.to_vec(),
                None => resp.body,
            };
            check_length(body, expected).map(|b| TaskOutcome::Fetched(Some(b)))
        }
        403 => {
            tracing::debug!(url = item.url(), chunk, "redirect expired");
            let mut record = item.record();
            record.invalidate_redirect();
            record.set_http_error(403);
            Ok(TaskOutcome::Fetched(None))
        }
        status @ (402 | 404 | 410) => {
            tracing::warn!(url = item.url(), status, "item unavailable");
            item.record().mark_unavailable(status);
            Ok(TaskOutcome::Fetched(None))
        }
        status => {
            item.record().set_http_error(status);
            Err(TaskError::Http(status))
        }
    }
}

fn check_length(body: Vec<u8>, expected: u64) -> Result<Vec<u8>, TaskError> {
    if body.len() as u64 == expected {
        Ok(body)
    } else {
        Err(TaskError::PartialTransfer {
            expected,
            received: body.len() as u64,
        })
    }
}

fn log_playback(item: &ItemRef, upstream: &dyn Upstream) -> Result<TaskOutcome, TaskError> {
    match upstream.log_playcount(item.url())? {
        status @ 200..=399 => {
            tracing::debug!(url = item.url(), status, "playcount logged");
            Ok(TaskOutcome::PlayLogged)
        }
        status @ (401 | 403) => {
            tracing::warn!(url = item.url(), status, "playcount not accepted");
            Ok(TaskOutcome::PlayLogged)
        }
        status => Err(TaskError::Http(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use crate::upstream::RangeResponse;
    use std::sync::Mutex;

    const CS: u64 = 4;

    /// Upstream answering every call with canned values.
    struct Canned {
        status: u16,
        body: Vec<u8>,
        resolve: Mutex<Option<Result<ResolvedStream, UpstreamError>>>,
    }

    impl Canned {
        fn get(status: u16, body: &[u8]) -> Self {
            Canned {
                status,
                body: body.to_vec(),
                resolve: Mutex::new(None),
            }
        }

        fn resolving(r: Result<ResolvedStream, UpstreamError>) -> Self {
            Canned {
                status: 200,
                body: Vec::new(),
                resolve: Mutex::new(Some(r)),
            }
        }
    }

    impl Upstream for Canned {
        fn resolve(&self, _url: &str, skip: bool) -> Result<ResolvedStream, UpstreamError> {
            assert!(skip);
            self.resolve.lock().unwrap().take().unwrap()
        }

        fn range_get(&self, _redirect: &str, _range: ByteRange) -> Result<RangeResponse, UpstreamError> {
            Ok(RangeResponse {
                status: self.status,
                body: self.body.clone(),
            })
        }

        fn log_playcount(&self, _url: &str) -> Result<u16, UpstreamError> {
            Ok(self.status)
        }
    }

    fn resolved_item(len: u64) -> ItemRef {
        let item = Item::new("http://x/tracks/1/stream");
        item.record().apply_resolved(&ResolvedStream {
            redirect_url: "http://cdn/x".into(),
            content_length: len,
            etag: None,
            expires: None,
            bitrate: None,
        });
        item
    }

    fn fetch_with(item: &ItemRef, chunk: u32, up: &Canned) -> Result<TaskOutcome, TaskError> {
        Task::Fetch {
            item: ItemRef::clone(item),
            chunk,
        }
        .execute(up, CS)
    }

    #[test]
    fn partial_content_is_data() {
        let item = resolved_item(10);
        let out = fetch_with(&item, 2, &Canned::get(206, b"89")).unwrap();
        assert!(matches!(out, TaskOutcome::Fetched(Some(ref b)) if b == b"89"));
    }

    #[test]
    fn full_body_is_sliced_to_chunk() {
        let item = resolved_item(10);
        let out = fetch_with(&item, 1, &Canned::get(200, b"0123456789")).unwrap();
        assert!(matches!(out, TaskOutcome::Fetched(Some(ref b)) if b == b"4567"));
    }

    #[test]
    fn short_body_is_partial_transfer() {
        let item = resolved_item(10);
        let err = fetch_with(&item, 0, &Canned::get(206, b"01")).unwrap_err();
        assert!(matches!(err, TaskError::PartialTransfer { expected: 4, received: 2 }));
    }

    #[test]
    fn forbidden_invalidates_redirect() {
        let item = resolved_item(10);
        let out = fetch_with(&item, 0, &Canned::get(403, b"")).unwrap();
        assert!(matches!(out, TaskOutcome::Fetched(None)));
        let rec = item.snapshot();
        assert!(!rec.is_redirect_valid(false));
        assert_eq!(rec.http_error, 403);
        assert!(!rec.unavailable);
    }

    #[test]
    fn gone_marks_unavailable() {
        for status in [402, 404, 410] {
            let item = resolved_item(10);
            let out = fetch_with(&item, 0, &Canned::get(status, b"")).unwrap();
            assert!(matches!(out, TaskOutcome::Fetched(None)));
            assert!(!item.is_available());
            assert_eq!(item.snapshot().http_error, status);
        }
    }

    #[test]
    fn other_status_is_retryable_error() {
        let item = resolved_item(10);
        let err = fetch_with(&item, 0, &Canned::get(500, b"")).unwrap_err();
        assert!(matches!(err, TaskError::Http(500)));
        assert_eq!(item.snapshot().http_error, 500);
        assert!(item.is_available());
    }

    #[test]
    fn resolver_4xx_marks_unavailable() {
        let item = Item::new("http://x/tracks/1/stream");
        let up = Canned::resolving(Err(UpstreamError::Resolver { status: 404 }));
        let out = Task::Resolve { item: ItemRef::clone(&item) }.execute(&up, CS).unwrap();
        assert!(matches!(out, TaskOutcome::Resolved(None)));
        assert!(!item.is_available());
    }

    #[test]
    fn resolver_5xx_is_retryable() {
        let item = Item::new("http://x/tracks/1/stream");
        let up = Canned::resolving(Err(UpstreamError::Resolver { status: 503 }));
        let err = Task::Resolve { item: ItemRef::clone(&item) }.execute(&up, CS).unwrap_err();
        assert!(matches!(err, TaskError::Upstream(UpstreamError::Resolver { status: 503 })));
        assert_eq!(item.snapshot().http_error, 503);
        assert!(item.is_available());
    }

    #[test]
    fn playcount_statuses() {
        let item = Item::new("http://x/tracks/1/stream");
        let task = Task::LogPlayback { item };
        assert!(matches!(task.execute(&Canned::get(302, b""), CS), Ok(TaskOutcome::PlayLogged)));
        assert!(matches!(task.execute(&Canned::get(401, b""), CS), Ok(TaskOutcome::PlayLogged)));
        assert!(matches!(task.execute(&Canned::get(500, b""), CS), Err(TaskError::Http(500))));
    }
}
