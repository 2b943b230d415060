//! In-memory upstream for unit tests.

use crate::chunk::ByteRange;
use crate::upstream::{RangeResponse, ResolvedStream, Upstream, UpstreamError};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Mutex;

#[derive(Default)]
struct State {
    log: Vec<String>,
    resolves: u32,
    fetch_statuses: VecDeque<u16>,
    resolve_errors: VecDeque<u16>,
}

/// Serves `body` behind a fake resolver. Every call is logged as
/// `resolve`, `fetch:<start>` or `playcount`.
pub(crate) struct FakeUpstream {
    body: Vec<u8>,
    state: Mutex<State>,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FakeUpstream {
    pub(crate) fn new(body: Vec<u8>) -> Self {
        FakeUpstream {
            body,
            state: Mutex::new(State::default()),
            gate: Mutex::new(None),
        }
    }

    /// Make the first call block until the returned sender fires.
    pub(crate) fn gated(self) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some(rx);
        (self, tx)
    }

    /// Answer the next range GET with `status` and an empty body.
    pub(crate) fn push_fetch_status(&self, status: u16) {
        self.state.lock().unwrap().fetch_statuses.push_back(status);
    }

    /// Fail the next resolve with resolver status `status`.
    pub(crate) fn push_resolve_error(&self, status: u16) {
        self.state.lock().unwrap().resolve_errors.push_back(status);
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|l| l.starts_with(prefix)).count()
    }

    fn enter(&self, entry: String) {
        let gate = self.gate.lock().unwrap().take();
        if let Some(rx) = gate {
            let _ = rx.recv();
        }
        self.state.lock().unwrap().log.push(entry);
    }
}

impl Upstream for FakeUpstream {
    fn resolve(&self, _url: &str, _skip: bool) -> Result<ResolvedStream, UpstreamError> {
        self.enter("resolve".to_string());
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.resolve_errors.pop_front() {
            return Err(UpstreamError::Resolver { status });
        }
        state.resolves += 1;
        Ok(ResolvedStream {
            redirect_url: format!("http://cdn.test/{}", state.resolves),
            content_length: self.body.len() as u64,
            etag: None,
            expires: None,
            bitrate: None,
        })
    }

    fn range_get(&self, _redirect: &str, range: ByteRange) -> Result<RangeResponse, UpstreamError> {
        self.enter(format!("fetch:{}", range.start));
        if let Some(status) = self.state.lock().unwrap().fetch_statuses.pop_front() {
            return Ok(RangeResponse {
                status,
                body: Vec::new(),
            });
        }
        let start = (range.start as usize).min(self.body.len());
        let end = (range.end() as usize).min(self.body.len());
        Ok(RangeResponse {
            status: 206,
            body: self.body[start..end].to_vec(),
        })
    }

    fn log_playcount(&self, _url: &str) -> Result<u16, UpstreamError> {
        self.enter("playcount".to_string());
        Ok(302)
    }
}
