//! Disk-backed chunk cache.
//!
//! Layout under the base directory:
//! - `Incomplete/<hash>.chunks`: raw chunk bytes, one chunk-size slot per
//!   chunk in arrival order (the final short chunk is zero-padded).
//! - `Incomplete/<hash>.index`: the item's index file.
//! - `Complete/<hash>`: the assembled file, exact length.
//!
//! The store keeps an in-memory cache of item records. Records are shared
//! handles and are reset in place when their data is purged, so queues and
//! pending requests holding them observe the purge.

mod assemble;
mod chunk_file;

pub use assemble::{AssembleError, AssemblyMode};

use crate::checksum;
use crate::chunk::{ByteRange, ChunkIndex, ChunkRange};
use crate::item::index_file::{self, IndexEntry};
use crate::item::{Item, ItemRecord, ItemRef};
use crate::upstream::ResolvedStream;
use anyhow::{bail, Context, Result};
use assemble::Assembly;
use chunk_file::ChunkFile;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Temporary file suffix used before atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

const INCOMPLETE_DIR: &str = "Incomplete";
const COMPLETE_DIR: &str = "Complete";
const CHUNKS_EXT: &str = "chunks";
const INDEX_EXT: &str = "index";

/// How long a read waits for an in-progress assembly to settle.
const CONVERTING_WAIT: Duration = Duration::from_millis(25);
const CONVERTING_POLLS: u32 = 40;

/// Path for the temp file: appends `.part` to the final path.
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    PathBuf::from(o)
}

/// Shared handle to the on-disk cache. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    chunk_size: u64,
    complete_dir: PathBuf,
    incomplete_dir: PathBuf,
    items: Mutex<HashMap<String, ItemRef>>,
    /// Hashes of items whose assembly is running.
    converting: Mutex<HashSet<String>>,
}

impl Store {
    /// Open (and create) the cache under `base`.
    pub fn open(base: &Path, chunk_size: u64) -> Result<Store> {
        if chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        let incomplete_dir = base.join(INCOMPLETE_DIR);
        let complete_dir = base.join(COMPLETE_DIR);
        fs::create_dir_all(&incomplete_dir)
            .with_context(|| format!("create {}", incomplete_dir.display()))?;
        fs::create_dir_all(&complete_dir)
            .with_context(|| format!("create {}", complete_dir.display()))?;
        tracing::info!(base = %base.display(), chunk_size, "store opened");
        Ok(Store {
            inner: Arc::new(StoreInner {
                chunk_size,
                complete_dir,
                incomplete_dir,
                items: Mutex::new(HashMap::new()),
                converting: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.inner.chunk_size
    }

    /// Cached record for `url`, loading it from disk on first use.
    ///
    /// Never fails: without data on disk the record has `content_length == 0`.
    pub fn get_metadata(&self, url: &str) -> ItemRef {
        let hash = checksum::url_hash(url);
        let mut items = crate::lock(&self.inner.items);
        if let Some(item) = items.get(&hash) {
            return Arc::clone(item);
        }
        let item = self.read_metadata(url);
        items.insert(hash, Arc::clone(&item));
        item
    }

    /// Drop the cached record so the next lookup re-reads disk state.
    pub fn remove_metadata(&self, url: &str) -> bool {
        let hash = checksum::url_hash(url);
        crate::lock(&self.inner.items).remove(&hash).is_some()
    }

    /// Apply freshly resolved metadata and persist the index file.
    ///
    /// When the item already carried an ETag (or has a completed file whose
    /// md5 stands in for one) that differs from the resolved one, the upstream
    /// content changed and every cached byte for the URL is purged first.
    /// Returns false if the index file could not be written.
    pub fn store_metadata(&self, item: &Item, resolved: &ResolvedStream) -> bool {
        if let Some(existing) = self.known_etag(item) {
            if resolved.etag.as_deref() != Some(existing.as_str()) {
                tracing::warn!(
                    url = item.url(),
                    old = %existing,
                    new = ?resolved.etag,
                    "etag changed, removing cached data"
                );
                self.remove_all_data(item);
            }
        }

        item.record().apply_resolved(resolved);
        if self.complete_path(item).exists() {
            return true;
        }
        match self.write_index(item) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(url = item.url(), "storing index failed: {:#}", e);
                false
            }
        }
    }

    /// Chunks of `range` still to be downloaded.
    pub fn compute_missing_chunks(&self, url: &str, range: ChunkRange) -> ChunkIndex {
        let item = self.get_metadata(url);
        if self.complete_path(&item).exists() {
            return ChunkIndex::new();
        }
        let record = item.record();
        let Some(last) = record.last_chunk(self.chunk_size()) else {
            // Unknown length: assume everything is missing.
            return range.to_index();
        };
        (range.start..range.end())
            .filter(|&n| n <= last && !record.has_chunk(n))
            .collect()
    }

    /// Persist one downloaded chunk. Returns false when nothing was stored:
    /// empty data, item already complete, chunk already present, chunk out of
    /// range, or the disk is unavailable.
    ///
    /// Storing the last missing chunk starts assembly on a background thread.
    pub fn append_chunk(&self, url: &str, data: &[u8], chunk: u32) -> bool {
        if data.is_empty() {
            tracing::warn!(url, chunk, "not storing empty chunk");
            return false;
        }
        let item = self.get_metadata(url);
        if self.complete_path(&item).exists() {
            tracing::debug!(url, chunk, "complete file exists, not adding data");
            return false;
        }

        let (slot, content_length) = {
            let record = item.record();
            if record.has_chunk(chunk) {
                tracing::debug!(url, chunk, "chunk already stored");
                return false;
            }
            if let Some(last) = record.last_chunk(self.chunk_size()) {
                if chunk > last {
                    tracing::warn!(url, chunk, last, "chunk beyond content length");
                    return false;
                }
            }
            (record.downloaded.len(), record.content_length)
        };
        if content_length == 0 {
            tracing::warn!(url, chunk, "content length unknown, not storing");
            return false;
        }

        let path = self.chunks_path(&item);
        let written = ChunkFile::open_rw(&path)
            .and_then(|f| f.write_slot(slot, self.chunk_size(), data));
        if let Err(e) = written {
            tracing::warn!(url, chunk, "storage not available, not adding data: {:#}", e);
            return false;
        }
        tracing::debug!(url, chunk, slot, bytes = data.len(), "stored chunk");

        let complete = {
            let mut record = item.record();
            record.downloaded.push(chunk);
            record.downloaded.len() as u32 == record.number_of_chunks(self.chunk_size())
        };
        if let Err(e) = self.write_index(&item) {
            tracing::warn!(url, "storing index failed: {:#}", e);
        }
        if complete {
            self.spawn_assembly(item);
        }
        true
    }

    /// Stored bytes for `range` of `url`.
    ///
    /// The range is clipped to the content length when it is known. Fails
    /// if any covered chunk is not on disk.
    pub fn read_bytes(&self, url: &str, range: ByteRange) -> Result<Vec<u8>> {
        let item = self.get_metadata(url);
        let cs = self.chunk_size();
        let length = item.content_length();
        let actual = if length > 0 {
            range
                .intersection(&ByteRange::new(0, length))
                .with_context(|| format!("range {:?} outside content length {}", range, length))?
        } else {
            range
        };

        let chunks = actual.chunk_range(cs);
        if chunks.length == 1 && actual.length == cs {
            return self.read_chunk(&item, chunks.start);
        }
        let mut data = Vec::with_capacity((chunks.length as u64 * cs) as usize);
        for n in chunks.start..chunks.end() {
            data.extend_from_slice(&self.read_chunk(&item, n)?);
        }
        let from = (actual.start % cs) as usize;
        let to = from + actual.length as usize;
        match data.get(from..to) {
            Some(slice) => Ok(slice.to_vec()),
            None => bail!("short read for {:?}: have {} bytes", actual, data.len()),
        }
    }

    /// Path of the completed file, if assembly finished.
    pub fn complete_file(&self, url: &str) -> Option<PathBuf> {
        let path = self
            .inner
            .complete_dir
            .join(checksum::url_hash(url));
        path.exists().then_some(path)
    }

    /// Bump the completed file's modification time so a cache janitor keeps it.
    pub fn touch(&self, url: &str) -> Result<()> {
        if let Some(path) = self.complete_file(url) {
            let f = fs::File::options()
                .write(true)
                .open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            f.set_modified(SystemTime::now())
                .with_context(|| format!("touch {}", path.display()))?;
        }
        Ok(())
    }

    /// True while the item's completed file is being assembled.
    pub fn is_converting(&self, url: &str) -> bool {
        crate::lock(&self.inner.converting).contains(&checksum::url_hash(url))
    }

    fn read_metadata(&self, url: &str) -> ItemRef {
        let hash = checksum::url_hash(url);
        let index = self.inner.incomplete_dir.join(format!("{}.{}", hash, INDEX_EXT));
        let complete = self.inner.complete_dir.join(&hash);
        if index.exists() {
            match index_file::read(&index) {
                Ok(entry) if entry.url == url => return Item::with_record(url, entry.into_record()),
                Ok(entry) => {
                    tracing::error!(url, stored = %entry.url, "index file belongs to another url, deleting");
                }
                Err(e) => tracing::error!(url, "could not read metadata, deleting: {:#}", e),
            }
            let item = Item::new(url);
            self.remove_all_data(&item);
            item
        } else if let Ok(meta) = fs::metadata(&complete) {
            Item::with_record(
                url,
                ItemRecord {
                    content_length: meta.len(),
                    ..Default::default()
                },
            )
        } else {
            Item::new(url)
        }
    }

    /// ETag to compare against upstream: the recorded one, else the md5 of a
    /// completed file.
    fn known_etag(&self, item: &Item) -> Option<String> {
        if let Some(etag) = item.record().etag.clone() {
            return Some(etag);
        }
        let complete = self.complete_path(item);
        if !complete.exists() {
            return None;
        }
        match checksum::etag_for_path(&complete) {
            Ok(etag) => {
                item.record().etag = Some(etag.clone());
                Some(etag)
            }
            Err(e) => {
                tracing::warn!(url = item.url(), "hashing completed file failed: {:#}", e);
                None
            }
        }
    }

    fn write_index(&self, item: &Item) -> Result<()> {
        let entry = IndexEntry::from_record(item.url(), &item.record());
        index_file::write(&self.index_path(item), &entry)
    }

    fn read_chunk(&self, item: &Item, chunk: u32) -> Result<Vec<u8>> {
        let cs = self.chunk_size();
        let mut polls = 0;
        loop {
            let record = item.snapshot();
            let start = chunk as u64 * cs;
            if start >= record.content_length {
                bail!("chunk {} beyond content length {}", chunk, record.content_length);
            }
            let len = cs.min(record.content_length - start) as usize;

            match self.read_chunk_once(item, &record, chunk, len) {
                Ok(data) => return Ok(data),
                Err(e) if e.kind() == io::ErrorKind::NotFound && self.is_converting(item.url()) => {
                    if polls >= CONVERTING_POLLS {
                        bail!("chunk {} unavailable while assembling {}", chunk, item.url());
                    }
                    polls += 1;
                    std::thread::sleep(CONVERTING_WAIT);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("read chunk {} of {}", chunk, item.url()))
                }
            }
        }
    }

    fn read_chunk_once(
        &self,
        item: &Item,
        record: &ItemRecord,
        chunk: u32,
        len: usize,
    ) -> io::Result<Vec<u8>> {
        let cs = self.chunk_size();
        let complete = self.complete_path(item);
        match ChunkFile::open_read(&complete) {
            Ok(f) => return f.read_at(chunk as u64 * cs, len),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let slot = record
            .slot_of(chunk)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "chunk not downloaded"))?;
        match ChunkFile::open_read(&self.chunks_path(item)) {
            Ok(f) => return f.read_at(slot as u64 * cs, len),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        // Mid-move: an in-order chunk file sits at the temp path, slot == chunk.
        let part = temp_path(&complete);
        if record.is_ordered() {
            if let Ok(f) = ChunkFile::open_read(&part) {
                return f.read_at(chunk as u64 * cs, len);
            }
        }
        Err(io::Error::new(io::ErrorKind::NotFound, "no chunk source"))
    }

    fn spawn_assembly(&self, item: ItemRef) {
        crate::lock(&self.inner.converting).insert(item.hash().to_string());
        let store = self.clone();
        let spawned = std::thread::Builder::new()
            .name("aproxy-assemble".into())
            .spawn(move || store.assemble(&item));
        if let Err(e) = spawned {
            tracing::error!("could not start assembly thread: {}", e);
        }
    }

    /// Build the completed file for a fully downloaded item. On success the
    /// incomplete files are removed; on failure every cached byte is purged.
    pub(crate) fn assemble(&self, item: &Item) {
        let record = item.snapshot();
        let chunks = self.chunks_path(item);
        let complete = self.complete_path(item);
        let result = Assembly {
            chunk_file: &chunks,
            complete_file: &complete,
            content_length: record.content_length,
            chunk_size: self.chunk_size(),
            etag: record.etag.as_deref(),
            downloaded: &record.downloaded,
        }
        .run();

        match result {
            Ok(mode) => {
                tracing::info!(url = item.url(), ?mode, "completed file written");
                self.remove_incomplete_data(item);
            }
            Err(e) => {
                tracing::warn!(url = item.url(), "assembly failed: {}", e);
                self.remove_all_data(item);
            }
        }
        crate::lock(&self.inner.converting).remove(item.hash());
    }

    fn remove_all_data(&self, item: &Item) {
        tracing::warn!(url = item.url(), "removing all data");
        let complete = self.complete_path(item);
        remove_if_exists(&complete);
        remove_if_exists(&temp_path(&complete));
        self.remove_incomplete_data(item);
        item.record().reset_data();
    }

    fn remove_incomplete_data(&self, item: &Item) {
        remove_if_exists(&self.chunks_path(item));
        remove_if_exists(&self.index_path(item));
    }

    fn complete_path(&self, item: &Item) -> PathBuf {
        self.inner.complete_dir.join(item.hash())
    }

    fn chunks_path(&self, item: &Item) -> PathBuf {
        self.inner
            .incomplete_dir
            .join(format!("{}.{}", item.hash(), CHUNKS_EXT))
    }

    fn index_path(&self, item: &Item) -> PathBuf {
        self.inner
            .incomplete_dir
            .join(format!("{}.{}", item.hash(), INDEX_EXT))
    }
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "could not delete: {}", e),
    }
}

#[cfg(test)]
mod tests;
