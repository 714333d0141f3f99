/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 */

//! Splitting a resource into fixed-size byte-range chunks.

use super::transport::ByteRange;
use serde::Serialize;

/// One planned chunk of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub id: usize,
    /// Start byte offset (inclusive)
    pub start: u64,
    /// End byte offset (inclusive)
    pub end: u64,
}

impl ChunkRange {
    /// Total size of this chunk
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn range(&self) -> ByteRange {
        ByteRange {
            start: self.start,
            end: self.end,
        }
    }
}

/// Progress of one chunk, as reported to consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkProgress {
    pub id: usize,
    pub start: u64,
    pub end: u64,
    pub loaded: u64,
    pub completed: bool,
}

impl ChunkProgress {
    pub fn total(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl From<&ChunkRange> for ChunkProgress {
    fn from(chunk: &ChunkRange) -> Self {
        Self {
            id: chunk.id,
            start: chunk.start,
            end: chunk.end,
            loaded: 0,
            completed: false,
        }
    }
}

/// Cover `[0, total_size)` with contiguous chunks of `chunk_size` bytes;
/// the last one takes whatever remains.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let chunk_size = chunk_size.max(1);
    let count = total_size.div_ceil(chunk_size) as usize;
    let mut chunks = Vec::with_capacity(count);
    let mut start = 0u64;

    while start < total_size {
        let end = (start + chunk_size - 1).min(total_size - 1);
        chunks.push(ChunkRange {
            id: chunks.len(),
            start,
            end,
        });
        start = end + 1;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_cover(chunks: &[ChunkRange], size: u64) {
        let mut expected_start = 0;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.id, i);
            assert_eq!(c.start, expected_start, "gap or overlap at chunk {}", i);
            assert!(c.end >= c.start);
            expected_start = c.end + 1;
        }
        assert_eq!(expected_start, size);
    }

    #[test]
    fn test_cover_and_last_chunk_size() {
        let chunk = 1000u64;
        for size in [1u64, 999, 1000, 1001, 2500, 10_000, 123_457] {
            let chunks = plan_chunks(size, chunk);
            assert_exact_cover(&chunks, size);
            assert_eq!(chunks.len() as u64, size.div_ceil(chunk));

            let expected_last = if size % chunk == 0 { chunk } else { size % chunk };
            assert_eq!(chunks.last().unwrap().size(), expected_last, "size {}", size);
            assert!(chunks[..chunks.len() - 1].iter().all(|c| c.size() == chunk));
        }
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        assert!(plan_chunks(0, 1024).is_empty());
    }

    #[test]
    fn test_progress_from_range() {
        let chunk = ChunkRange {
            id: 3,
            start: 3000,
            end: 3999,
        };
        let p = ChunkProgress::from(&chunk);
        assert_eq!(p.total(), 1000);
        assert!(!p.completed);
        assert_eq!(chunk.range().header_value(), "bytes=3000-3999");
    }
}
