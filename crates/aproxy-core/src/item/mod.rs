//! Per-URL item metadata and mutable chunk-presence state.
//!
//! An [`Item`] is shared (`Arc`) between the store's cache, the loader's
//! queues, pending futures and in-flight tasks. Its mutable part lives in an
//! [`ItemRecord`] behind a mutex; callers hold the guard only for short,
//! non-blocking sections.

pub mod index_file;

use crate::chunk::ChunkIndex;
use crate::upstream::ResolvedStream;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared handle to an item.
pub type ItemRef = Arc<Item>;

/// One remote audio resource, identified by the hash of its logical URL.
pub struct Item {
    url: String,
    hash: String,
    record: Mutex<ItemRecord>,
}

/// Mutable metadata for an item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemRecord {
    /// Total size in bytes; 0 means unknown.
    pub content_length: u64,
    /// ETag as sent by upstream (quotes included).
    pub etag: Option<String>,
    /// Short-lived authorized URL the chunks are fetched from.
    pub redirect_url: Option<String>,
    /// Unix seconds after which the redirect is expected to stop working.
    pub redirect_expires: Option<u64>,
    pub bitrate: Option<u32>,
    /// Terminal for the process lifetime once set.
    pub unavailable: bool,
    /// Last upstream HTTP error status (0 = none).
    pub http_error: u16,
    /// Downloaded chunk numbers in arrival order. The position of a chunk in
    /// this list is its slot in the incomplete chunk file.
    pub downloaded: Vec<u32>,
}

impl Item {
    pub fn new(url: impl Into<String>) -> ItemRef {
        Self::with_record(url, ItemRecord::default())
    }

    pub fn with_record(url: impl Into<String>, record: ItemRecord) -> ItemRef {
        let url = url.into();
        Arc::new(Item {
            hash: crate::checksum::url_hash(&url),
            url,
            record: Mutex::new(record),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stable file-name-safe hash of the logical URL.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Lock the mutable record.
    pub fn record(&self) -> MutexGuard<'_, ItemRecord> {
        crate::lock(&self.record)
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> ItemRecord {
        self.record().clone()
    }

    pub fn is_available(&self) -> bool {
        !self.record().unavailable
    }

    pub fn content_length(&self) -> u64 {
        self.record().content_length
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("url", &self.url)
            .field("hash", &self.hash)
            .field("record", &*self.record())
            .finish()
    }
}

impl ItemRecord {
    /// Number of chunks the full content occupies.
    pub fn number_of_chunks(&self, chunk_size: u64) -> u32 {
        self.content_length.div_ceil(chunk_size) as u32
    }

    /// Index of the last valid chunk, if the length is known.
    pub fn last_chunk(&self, chunk_size: u64) -> Option<u32> {
        self.number_of_chunks(chunk_size).checked_sub(1)
    }

    pub fn has_chunk(&self, chunk: u32) -> bool {
        self.downloaded.contains(&chunk)
    }

    /// Slot of `chunk` in the incomplete chunk file (arrival position).
    pub fn slot_of(&self, chunk: u32) -> Option<usize> {
        self.downloaded.iter().position(|&c| c == chunk)
    }

    pub fn downloaded_index(&self) -> ChunkIndex {
        self.downloaded.iter().copied().collect()
    }

    /// True if chunk fetches may go straight to the redirect URL.
    ///
    /// The expiry timestamp relies on the local clock agreeing with the
    /// upstream's, so it is only consulted when `honor_expiry` is set;
    /// otherwise a 403 on fetch is what invalidates the redirect.
    pub fn is_redirect_valid(&self, honor_expiry: bool) -> bool {
        if self.content_length == 0 || self.redirect_url.is_none() {
            return false;
        }
        if honor_expiry {
            if let Some(expires) = self.redirect_expires {
                return unix_now() < expires;
            }
        }
        true
    }

    pub fn invalidate_redirect(&mut self) {
        self.redirect_url = None;
    }

    pub fn mark_unavailable(&mut self, status: u16) {
        self.unavailable = true;
        self.http_error = status;
    }

    pub fn set_http_error(&mut self, status: u16) {
        self.http_error = status;
    }

    /// Take over freshly resolved metadata; clears the last error.
    pub fn apply_resolved(&mut self, resolved: &ResolvedStream) {
        self.redirect_url = Some(resolved.redirect_url.clone());
        self.content_length = resolved.content_length;
        self.etag = resolved.etag.clone();
        self.redirect_expires = resolved.expires;
        self.bitrate = resolved.bitrate;
        self.http_error = 0;
    }

    /// Forget all cached chunk state (after a purge).
    pub fn reset_data(&mut self) {
        self.downloaded.clear();
        self.content_length = 0;
        self.etag = None;
    }

    /// Chunks arrived strictly in ascending order.
    pub fn is_ordered(&self) -> bool {
        self.downloaded.windows(2).all(|w| w[0] <= w[1])
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
