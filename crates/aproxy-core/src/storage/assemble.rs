//! Completion assembler: turns a full chunk file into one canonical file.
//!
//! The output is built at `<complete>.part` and renamed into place only after
//! the optional ETag check, so a file under `Complete/` is always final.

use super::chunk_file::ChunkFile;
use super::temp_path;
use crate::checksum::{etag_matches, md5_reader, MAX_ETAG_CHECK_SIZE};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("assembly i/o: {0}")]
    Io(#[from] io::Error),
    #[error("chunk {0} missing from chunk file")]
    MissingChunk(u32),
    #[error("etag {expected} does not match content md5 {actual}")]
    EtagMismatch { expected: String, actual: String },
}

/// Which path the assembler took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyMode {
    /// Chunks arrived in order: the chunk file was moved and truncated.
    Moved,
    /// Chunks were copied from their arrival slots in logical order.
    Reassembled,
}

/// Inputs for one assembly.
pub(crate) struct Assembly<'a> {
    pub chunk_file: &'a Path,
    pub complete_file: &'a Path,
    pub content_length: u64,
    pub chunk_size: u64,
    pub etag: Option<&'a str>,
    /// Chunk numbers in arrival order.
    pub downloaded: &'a [u32],
}

impl Assembly<'_> {
    pub(crate) fn run(&self) -> Result<AssemblyMode, AssembleError> {
        let part = temp_path(self.complete_file);
        if let Some(parent) = self.complete_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let result = self.build(&part).and_then(|mode| {
            self.verify(&part)?;
            fs::rename(&part, self.complete_file)?;
            Ok(mode)
        });
        if result.is_err() {
            let _ = fs::remove_file(&part);
        }
        result
    }

    fn build(&self, part: &Path) -> Result<AssemblyMode, AssembleError> {
        let count = self.content_length.div_ceil(self.chunk_size) as u32;
        let in_order = self.downloaded.len() == count as usize
            && self.downloaded.iter().enumerate().all(|(slot, &n)| slot as u32 == n);
        if in_order {
            tracing::debug!(path = %self.chunk_file.display(), "chunk file already in order, moving");
            fs::rename(self.chunk_file, part)?;
            File::options()
                .write(true)
                .open(part)?
                .set_len(self.content_length)?;
            return Ok(AssemblyMode::Moved);
        }

        tracing::debug!(path = %self.chunk_file.display(), "reassembling chunk file");
        let src = ChunkFile::open_read(self.chunk_file)?;
        let mut out = io::BufWriter::new(File::create(part)?);
        for n in 0..count {
            let slot = self
                .downloaded
                .iter()
                .position(|&c| c == n)
                .ok_or(AssembleError::MissingChunk(n))?;
            let start = n as u64 * self.chunk_size;
            let len = self.chunk_size.min(self.content_length - start) as usize;
            let data = src.read_at(slot as u64 * self.chunk_size, len)?;
            out.write_all(&data)?;
        }
        out.flush()?;
        Ok(AssemblyMode::Reassembled)
    }

    fn verify(&self, part: &Path) -> Result<(), AssembleError> {
        let Some(etag) = self.etag else {
            return Ok(());
        };
        if self.content_length > MAX_ETAG_CHECK_SIZE {
            return Ok(());
        }
        let actual = md5_reader(&mut File::open(part)?)?;
        if etag_matches(etag, &actual) {
            Ok(())
        } else {
            Err(AssembleError::EtagMismatch {
                expected: etag.to_string(),
                actual,
            })
        }
    }
}
