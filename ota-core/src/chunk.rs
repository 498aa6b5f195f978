//! Chunk planning: split a binary into fixed-size Data frame payloads.

use std::ops::Range;

/// One Data frame's slice of the binary. `sequence` is 1-based, as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub sequence: u16,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }
}

/// Number of Data frames needed for `total_len` bytes: ceil(total_len / chunk_size).
pub fn packet_count(total_len: u64, chunk_size: usize) -> Result<u16, ChunkPlanError> {
    if chunk_size == 0 {
        return Err(ChunkPlanError::ZeroChunkSize);
    }
    if total_len == 0 {
        return Err(ChunkPlanError::Empty);
    }
    let count = total_len.div_ceil(chunk_size as u64);
    u16::try_from(count).map_err(|_| ChunkPlanError::TooManyPackets {
        total_len,
        chunk_size,
    })
}

/// Range of the frame with the given 1-based sequence number.
pub fn chunk_at(sequence: u16, total_len: u64, chunk_size: usize) -> ChunkRange {
    let start = u64::from(sequence.saturating_sub(1)) * chunk_size as u64;
    let end = (start + chunk_size as u64).min(total_len);
    ChunkRange {
        sequence,
        start: start.min(total_len),
        end,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkPlanError {
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,
    #[error("nothing to transfer")]
    Empty,
    #[error("{total_len} bytes at {chunk_size} per frame exceeds 65535 frames")]
    TooManyPackets { total_len: u64, chunk_size: usize },
}
