//! Chunk vocabulary: which pieces of an item are present or missing, and how
//! byte ranges map onto fixed-size chunks.

mod index;
mod range;

pub use index::ChunkIndex;
pub use range::{ByteRange, ChunkRange};

/// Default chunk size: 128 KiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 128 * 1024;
