//! Binary index file: the persisted part of an item record.
//!
//! Layout (big-endian):
//! `u16 url_len, url bytes, u64 content_length, u16 etag_len, etag bytes,
//! u32 count, count * u32 chunk` with chunks in arrival order. An empty
//! etag means none.

use super::ItemRecord;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Errors decoding an index file.
#[derive(Debug, thiserror::Error)]
pub enum IndexFileError {
    #[error("index file truncated")]
    Truncated,
    #[error("index file string is not UTF-8")]
    InvalidUtf8,
    #[error("index file has no url")]
    MissingUrl,
    #[error("string too long for index file: {0} bytes")]
    StringTooLong(usize),
}

/// Decoded index file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub url: String,
    pub content_length: u64,
    pub etag: Option<String>,
    pub downloaded: Vec<u32>,
}

impl IndexEntry {
    pub fn from_record(url: &str, record: &ItemRecord) -> Self {
        IndexEntry {
            url: url.to_string(),
            content_length: record.content_length,
            etag: record.etag.clone(),
            downloaded: record.downloaded.clone(),
        }
    }

    pub fn into_record(self) -> ItemRecord {
        ItemRecord {
            content_length: self.content_length,
            etag: self.etag,
            downloaded: self.downloaded,
            ..Default::default()
        }
    }
}

pub fn encode(entry: &IndexEntry) -> Result<Vec<u8>, IndexFileError> {
    let etag = entry.etag.as_deref().unwrap_or("");
    let mut out = Vec::with_capacity(16 + entry.url.len() + etag.len() + entry.downloaded.len() * 4);
    put_str(&mut out, &entry.url)?;
    out.extend_from_slice(&entry.content_length.to_be_bytes());
    put_str(&mut out, etag)?;
    out.extend_from_slice(&(entry.downloaded.len() as u32).to_be_bytes());
    for chunk in &entry.downloaded {
        out.extend_from_slice(&chunk.to_be_bytes());
    }
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<IndexEntry, IndexFileError> {
    let mut r = Reader { buf: bytes };
    let url = r.string()?;
    if url.is_empty() {
        return Err(IndexFileError::MissingUrl);
    }
    let content_length = u64::from_be_bytes(r.array()?);
    let etag = r.string()?;
    let count = u32::from_be_bytes(r.array()?);
    let mut downloaded = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        downloaded.push(u32::from_be_bytes(r.array()?));
    }
    Ok(IndexEntry {
        url,
        content_length,
        etag: if etag.is_empty() { None } else { Some(etag) },
        downloaded,
    })
}

/// Write the index file via a temp file and rename, so readers never see a
/// half-written index.
pub fn write(path: &Path, entry: &IndexEntry) -> Result<()> {
    let bytes = encode(entry)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = crate::storage::temp_path(path);
    fs::write(&tmp, &bytes).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

pub fn read(path: &Path) -> Result<IndexEntry> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let entry = decode(&bytes).with_context(|| format!("decode {}", path.display()))?;
    Ok(entry)
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), IndexFileError> {
    let len = u16::try_from(s.len()).map_err(|_| IndexFileError::StringTooLong(s.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexFileError> {
        if self.buf.len() < n {
            return Err(IndexFileError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], IndexFileError> {
        let mut a = [0u8; N];
        a.copy_from_slice(self.take(N)?);
        Ok(a)
    }

    fn string(&mut self) -> Result<String, IndexFileError> {
        let len = u16::from_be_bytes(self.array()?) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| IndexFileError::InvalidUtf8)
    }
}
