use std::sync::{PoisonError, RwLock};

/// Granularity of the coverage bitmap.
pub const COVERAGE_CHUNK: u64 = 4096;

/// Chunk-granular record of container bytes already confirmed matched.
///
/// A chunk is marked only when a matched region contains all of it, so a
/// "covered" answer is never wrong. Concurrent readers may miss a mark that
/// is being written; that only costs a redundant verification.
pub struct CoverageBitmap {
    total: u64,
    chunks: u64,
    words: RwLock<Vec<u64>>,
}

impl CoverageBitmap {
    pub fn new(total_len: u64) -> Self {
        let chunks = total_len.div_ceil(COVERAGE_CHUNK);
        let words = RwLock::new(vec![0u64; chunks.div_ceil(64) as usize]);
        Self { total: total_len, chunks, words }
    }

    /// Chunks `[first, last)` lying entirely inside `[start, end)`. The final
    /// chunk of the container is shorter; it counts as contained when
    /// `end` reaches the container end.
    fn contained(&self, start: u64, end: u64) -> (u64, u64) {
        let first = start.div_ceil(COVERAGE_CHUNK);
        let last = if end >= self.total { self.chunks } else { end / COVERAGE_CHUNK };
        (first, last)
    }

    pub fn mark(&self, start: u64, end: u64) {
        let (first, last) = self.contained(start, end.min(self.total));
        if first >= last {
            return;
        }
        let mut words = self.words.write().unwrap_or_else(PoisonError::into_inner);
        for c in first..last {
            words[(c / 64) as usize] |= 1u64 << (c % 64);
        }
    }

    /// True when every chunk touching `[start, end)` is marked.
    pub fn is_covered(&self, start: u64, end: u64) -> bool {
        let end = end.min(self.total);
        if start >= end {
            return true;
        }
        let first = start / COVERAGE_CHUNK;
        let last = end.div_ceil(COVERAGE_CHUNK);
        let words = self.words.read().unwrap_or_else(PoisonError::into_inner);
        (first..last).all(|c| words[(c / 64) as usize] & (1u64 << (c % 64)) != 0)
    }

    pub fn covered_chunks(&self) -> u64 {
        let words = self.words.read().unwrap_or_else(PoisonError::into_inner);
        words.iter().map(|w| w.count_ones() as u64).sum()
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks
    }
}
