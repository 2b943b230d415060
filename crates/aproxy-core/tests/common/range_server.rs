//! Minimal HTTP/1.1 upstream for integration tests.
//!
//! `/stream/<name>` plays the resolver: it answers HEAD and GET with a 302 to
//! `/cdn/<name>` (or with an injected status). `/cdn/<name>` serves a single
//! static body with HEAD, Range GET, an md5 ETag and scripted failures.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// Status the resolver path answers with instead of redirecting.
    pub resolver_status: Option<u16>,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// If false, no ETag header is sent.
    pub send_etag: bool,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            resolver_status: None,
            support_ranges: true,
            send_etag: true,
        }
    }
}

struct State {
    body: Vec<u8>,
    etag: String,
    opts: RangeServerOptions,
    /// One "<METHOD> <path> <range>" line per request.
    log: Mutex<Vec<String>>,
    /// Statuses answered (with an empty body) to the next CDN GETs.
    cdn_statuses: Mutex<VecDeque<u16>>,
}

pub struct RangeServer {
    base: String,
    state: Arc<State>,
}

impl RangeServer {
    /// Starts a server in a background thread serving `body`. The server
    /// runs until the process exits.
    pub fn start(body: Vec<u8>) -> Self {
        Self::start_with_options(body, RangeServerOptions::default())
    }

    pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let etag = format!("\"{:x}\"", md5::compute(&body));
        let state = Arc::new(State {
            body,
            etag,
            opts,
            log: Mutex::new(Vec::new()),
            cdn_statuses: Mutex::new(VecDeque::new()),
        });
        let server_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let state = Arc::clone(&server_state);
                thread::spawn(move || handle(stream, &state));
            }
        });
        RangeServer {
            base: format!("http://127.0.0.1:{}", port),
            state,
        }
    }

    /// Logical URL resolved through a redirect.
    pub fn stream_url(&self) -> String {
        format!("{}/stream/track", self.base)
    }

    /// Direct URL of the body.
    pub fn cdn_url(&self) -> String {
        format!("{}/cdn/track", self.base)
    }

    pub fn etag(&self) -> &str {
        &self.state.etag
    }

    /// Answer the next CDN GET with `status`.
    pub fn push_cdn_status(&self, status: u16) {
        self.state.cdn_statuses.lock().unwrap().push_back(status);
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    /// Requests whose log line starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.requests().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

fn handle(mut stream: std::net::TcpStream, state: &State) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, path, range) = parse_request(request);
    let range_text = range
        .map(|(a, b)| format!("{}-{}", a, b))
        .unwrap_or_else(|| "-".to_string());
    state
        .log
        .lock()
        .unwrap()
        .push(format!("{} {} {}", method, path, range_text));

    if let Some(name) = path.strip_prefix("/stream/") {
        let response = match state.opts.resolver_status {
            Some(status) => format!(
                "HTTP/1.1 {} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status
            ),
            None => format!(
                "HTTP/1.1 302 Found\r\nLocation: /cdn/{}?Expires=4102444800\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                name
            ),
        };
        let _ = stream.write_all(response.as_bytes());
        return;
    }
    if !path.starts_with("/cdn/") {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        return;
    }

    let body = &state.body[..];
    let total = body.len() as u64;
    let etag = if state.opts.send_etag {
        format!("ETag: {}\r\n", state.etag)
    } else {
        String::new()
    };
    if method.eq_ignore_ascii_case("HEAD") {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\n{}x-amz-meta-bitrate: 128\r\nConnection: close\r\n\r\n",
            total, etag
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");
        return;
    }
    if let Some(status) = state.cdn_statuses.lock().unwrap().pop_front() {
        let response = format!(
            "HTTP/1.1 {} Scripted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    let (status, range_header, slice) = match range.filter(|_| state.opts.support_ranges) {
        Some((start, end_incl)) => {
            let start = start.min(total);
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl {
                ("416 Range Not Satisfiable", format!("bytes */{}", total), &body[0..0])
            } else {
                let end_excl = (end_incl + 1).min(total) as usize;
                let slice = body.get(start as usize..end_excl).unwrap_or(&body[0..0]);
                (
                    "206 Partial Content",
                    format!("bytes {}-{}/{}", start, end_excl.saturating_sub(1), total),
                    slice,
                )
            }
        }
        None => (
            "200 OK",
            format!("bytes 0-{}/{}", total.saturating_sub(1), total),
            body,
        ),
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Range: {}\r\n{}Connection: close\r\n\r\n",
        status,
        slice.len(),
        range_header,
        etag
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.write_all(slice);
}

/// Returns (method, path without query, optional (start, end_inclusive)).
fn parse_request(request: &str) -> (&str, &str, Option<(u64, u64)>) {
    let mut method = "";
    let mut path = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            let mut parts = line.split_whitespace();
            method = parts.next().unwrap_or("");
            let target = parts.next().unwrap_or("");
            path = target.split('?').next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if value.to_lowercase().starts_with("bytes=") {
                    let part = value[6..].trim();
                    if let Some((a, b)) = part.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, path, range)
}
