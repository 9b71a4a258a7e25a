//! Per-transfer chunk tracking using a compact bitfield.
//!
//! One bit per chunk sequence number, sized at announcement time. A
//! watermark over the leading received run keeps gap scans away from the
//! settled prefix.

use std::ops::Range;

/// Compact bitfield tracking which chunks of a transfer have arrived.
#[derive(Debug, Clone)]
pub struct ChunkBitfield {
    bits: Vec<u64>,
    chunk_count: u32,
    received_count: u32,
    highest_seen: Option<u32>,
    contiguous: u32,
}

impl ChunkBitfield {
    /// Create a new bitfield for a transfer with `chunk_count` chunks.
    pub fn new(chunk_count: u32) -> Self {
        Self {
            bits: vec![0u64; (chunk_count as usize).div_ceil(64)],
            chunk_count,
            received_count: 0,
            highest_seen: None,
            contiguous: 0,
        }
    }

    /// Mark a chunk as received. Returns true if it was newly received (not
    /// duplicate and in range).
    #[inline]
    pub fn set(&mut self, seq: u32) -> bool {
        if seq >= self.chunk_count {
            return false;
        }
        let (word, mask) = Self::locate(seq);
        if self.bits[word] & mask != 0 {
            return false; // already set
        }
        self.bits[word] |= mask;
        self.received_count += 1;
        self.highest_seen = Some(self.highest_seen.map_or(seq, |h| h.max(seq)));
        while self.contiguous < self.chunk_count && self.get(self.contiguous) {
            self.contiguous += 1;
        }
        true
    }

    /// Check if a chunk has been received.
    #[inline]
    pub fn get(&self, seq: u32) -> bool {
        if seq >= self.chunk_count {
            return false;
        }
        let (word, mask) = Self::locate(seq);
        self.bits[word] & mask != 0
    }

    #[inline]
    fn locate(seq: u32) -> (usize, u64) {
        let idx = seq as usize;
        (idx / 64, 1u64 << (idx % 64))
    }

    /// Returns true if all chunks have been received.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received_count >= self.chunk_count
    }

    /// Number of chunks received.
    #[inline]
    pub fn received(&self) -> u32 {
        self.received_count
    }

    /// Total chunk count.
    #[inline]
    pub fn total(&self) -> u32 {
        self.chunk_count
    }

    /// Highest sequence number received so far.
    #[inline]
    pub fn highest_seen(&self) -> Option<u32> {
        self.highest_seen
    }

    /// Length of the received run starting at chunk 0.
    #[inline]
    pub fn contiguous(&self) -> u32 {
        self.contiguous
    }

    /// Missing chunks inside `range`, in order. Nothing below the watermark
    /// is visited.
    pub fn missing_in(&self, range: Range<u32>) -> Vec<u32> {
        let start = range.start.max(self.contiguous);
        let end = range.end.min(self.chunk_count);
        (start..end).filter(|&seq| !self.get(seq)).collect()
    }

    /// Collect sequence numbers of all missing chunks.
    pub fn missing(&self) -> Vec<u32> {
        self.missing_in(0..self.chunk_count)
    }
}
