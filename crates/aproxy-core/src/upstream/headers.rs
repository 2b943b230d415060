//! Parse HTTP response header lines collected by curl.

/// Headers the upstream client cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ResponseHeaders {
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub location: Option<String>,
    pub bitrate: Option<u32>,
}

/// Parse header lines. When curl followed redirects the lines hold several
/// responses; only the block after the last status line counts.
pub(crate) fn parse_headers(lines: &[String]) -> ResponseHeaders {
    let start = lines
        .iter()
        .rposition(|l| l.starts_with("HTTP/"))
        .map(|i| i + 1)
        .unwrap_or(0);

    let mut out = ResponseHeaders::default();
    for line in &lines[start..] {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                out.content_length = value.parse::<u64>().ok();
            } else if name.eq_ignore_ascii_case("etag") {
                out.etag = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("location") {
                out.location = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("x-amz-meta-bitrate") {
                out.bitrate = value.parse::<u32>().ok();
            }
        }
    }
    out
}
