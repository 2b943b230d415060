//! Sparse set of chunk numbers backed by a growable bitmap.

use std::fmt;

/// Set of chunk numbers: one bit per chunk (LSB of byte 0 = chunk 0).
///
/// Grows on insert; iteration is always in ascending chunk order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ChunkIndex {
    bytes: Vec<u8>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index containing every chunk in `[start, start + count)`.
    pub fn from_span(start: u32, count: u32) -> Self {
        let mut idx = ChunkIndex::new();
        for n in start..start.saturating_add(count) {
            idx.insert(n);
        }
        idx
    }

    pub fn insert(&mut self, chunk: u32) {
        let byte_idx = chunk as usize / 8;
        let bit = chunk % 8;
        if byte_idx >= self.bytes.len() {
            self.bytes.resize(byte_idx + 1, 0);
        }
        self.bytes[byte_idx] |= 1 << bit;
    }

    pub fn remove(&mut self, chunk: u32) {
        let byte_idx = chunk as usize / 8;
        if let Some(b) = self.bytes.get_mut(byte_idx) {
            *b &= !(1 << (chunk % 8));
        }
        self.trim();
    }

    pub fn contains(&self, chunk: u32) -> bool {
        let byte_idx = chunk as usize / 8;
        self.bytes
            .get(byte_idx)
            .map(|&b| (b & (1 << (chunk % 8))) != 0)
            .unwrap_or(false)
    }

    /// Add every chunk of `other` to this set.
    pub fn union_with(&mut self, other: &ChunkIndex) {
        if other.bytes.len() > self.bytes.len() {
            self.bytes.resize(other.bytes.len(), 0);
        }
        for (dst, src) in self.bytes.iter_mut().zip(other.bytes.iter()) {
            *dst |= *src;
        }
    }

    /// Remove every chunk of `other` from this set.
    pub fn subtract(&mut self, other: &ChunkIndex) {
        for (dst, src) in self.bytes.iter_mut().zip(other.bytes.iter()) {
            *dst &= !*src;
        }
        self.trim();
    }

    /// Lowest chunk number in the set.
    pub fn first(&self) -> Option<u32> {
        self.iter().next()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    /// Number of chunks in the set.
    pub fn len(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bytes.iter().enumerate().flat_map(|(byte_idx, &b)| {
            (0..8u32)
                .filter(move |bit| b & (1 << bit) != 0)
                .map(move |bit| byte_idx as u32 * 8 + bit)
        })
    }

    fn trim(&mut self) {
        while self.bytes.last() == Some(&0) {
            self.bytes.pop();
        }
    }
}

impl FromIterator<u32> for ChunkIndex {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut idx = ChunkIndex::new();
        for n in iter {
            idx.insert(n);
        }
        idx
    }
}

impl fmt::Debug for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
