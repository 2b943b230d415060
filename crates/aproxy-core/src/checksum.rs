//! Content hashes: cache file naming and ETag verification.
//!
//! Upstream ETags for single-part objects are the quoted md5 of the body, so
//! an assembled file can be checked against the ETag its metadata carried.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Files above this size are not hashed for ETag comparison.
pub const MAX_ETAG_CHECK_SIZE: u64 = 5 * 1024 * 1024;

/// File-name-safe key for a logical URL: lowercase hex SHA-256.
pub fn url_hash(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Compute md5 of a file and return the digest as lowercase hex.
pub fn md5_path(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let digest = md5_reader(&mut f).with_context(|| format!("read {}", path.display()))?;
    Ok(digest)
}

/// md5 of everything `r` yields, as lowercase hex.
pub fn md5_reader<R: Read>(r: &mut R) -> io::Result<String> {
    let mut ctx = md5::Context::new();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// ETag as the upstream would send it for this file: the quoted md5.
pub fn etag_for_path(path: &Path) -> Result<String> {
    Ok(format!("\"{}\"", md5_path(path)?))
}

/// True if `etag` names the content whose md5 is `md5_hex`.
///
/// Quotes and a weak prefix are ignored. Multipart ETags (`<md5>-<parts>`)
/// are not a content hash and always match.
pub fn etag_matches(etag: &str, md5_hex: &str) -> bool {
    let tag = etag.trim().trim_start_matches("W/").trim_matches('"');
    if tag.contains('-') {
        return true;
    }
    tag.eq_ignore_ascii_case(md5_hex)
}
