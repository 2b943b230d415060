//! Positional reads and writes on chunk and cache files.

use anyhow::{Context, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// An open cache file addressed by byte offset (pread/pwrite style).
pub(crate) struct ChunkFile {
    file: File,
    path: PathBuf,
}

impl ChunkFile {
    /// Open for writing, creating the file if needed (no truncation).
    pub(crate) fn open_rw(path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open chunk file: {}", path.display()))?;
        Ok(ChunkFile {
            file,
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn open_read(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(ChunkFile {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Write `data` into slot `slot`, zero-padding to a full chunk so later
    /// slots keep stable offsets.
    pub(crate) fn write_slot(&self, slot: usize, chunk_size: u64, data: &[u8]) -> Result<()> {
        let offset = slot as u64 * chunk_size;
        let mut buf = Vec::with_capacity(chunk_size as usize);
        buf.extend_from_slice(data);
        if (buf.len() as u64) < chunk_size {
            buf.resize(chunk_size as usize, 0);
        }
        self.write_all_at(offset, &buf)
            .with_context(|| format!("chunk write to {} failed", self.path.display()))?;
        Ok(())
    }

    /// Read exactly `len` bytes at `offset`.
    pub(crate) fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    #[cfg(unix)]
    fn write_all_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    #[cfg(unix)]
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn write_all_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }

    #[cfg(not(unix))]
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buf)
    }
}
