//! Byte ranges and chunk-aligned ranges.

use super::ChunkIndex;

/// Contiguous bytes `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

/// Contiguous chunk numbers `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub start: u32,
    pub length: u32,
}

impl ByteRange {
    pub fn new(start: u64, length: u64) -> Self {
        debug_assert!(length > 0, "byte range must not be empty");
        ByteRange { start, length }
    }

    /// End offset (exclusive).
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    /// Smallest chunk range covering every byte of this range, or `None`
    /// when a chunk number would not fit in `u32`.
    pub fn try_chunk_range(&self, chunk_size: u64) -> Option<ChunkRange> {
        let start = self.start / chunk_size;
        let length = ((self.start % chunk_size) + self.length).div_ceil(chunk_size);
        let end = start.checked_add(length)?;
        u32::try_from(end).ok()?;
        Some(ChunkRange {
            start: u32::try_from(start).ok()?,
            length: u32::try_from(length).ok()?,
        })
    }

    /// Like [`ByteRange::try_chunk_range`], clamped to the last representable
    /// chunk.
    pub fn chunk_range(&self, chunk_size: u64) -> ChunkRange {
        self.try_chunk_range(chunk_size).unwrap_or_else(|| {
            let start = u32::try_from(self.start / chunk_size).unwrap_or(u32::MAX);
            ChunkRange {
                start,
                length: u32::MAX - start,
            }
        })
    }

    /// Overlap of two ranges, or `None` when they are disjoint.
    pub fn intersection(&self, other: &ByteRange) -> Option<ByteRange> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        if start < end {
            Some(ByteRange {
                start,
                length: end - start,
            })
        } else {
            None
        }
    }

    /// Range value with inclusive end (`start-end`) as used by curl and `Content-Range`.
    pub fn inclusive_span(&self) -> String {
        format!("{}-{}", self.start, self.end().saturating_sub(1))
    }
}

impl ChunkRange {
    pub fn new(start: u32, length: u32) -> Self {
        ChunkRange { start, length }
    }

    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.length)
    }

    /// Byte range spanned by these chunks.
    pub fn byte_range(&self, chunk_size: u64) -> ByteRange {
        ByteRange {
            start: self.start as u64 * chunk_size,
            length: self.length as u64 * chunk_size,
        }
    }

    pub fn to_index(&self) -> ChunkIndex {
        ChunkIndex::from_span(self.start, self.length)
    }
}
