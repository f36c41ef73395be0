//! Hash-addressed index over source sync points.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use xxhash_rust::xxh64::xxh64;

pub const DEFAULT_WINDOW_SIZE: usize = 64;

/// Hash of one fixed-size window starting at a sync point.
pub fn window_hash(window: &[u8]) -> u64 {
    xxh64(window, 0)
}

/// Where a hashed window lives in the source.
///
/// `offset` is a raw file offset or an elementary-stream offset depending on
/// [`HashIndex::uses_es_offsets`]. Ordering is by file, then offset, which is
/// what the matcher's locality search relies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: u32,
    pub offset: u64,
    pub is_video: bool,
    pub substream: u8,
}

/// Read-only (after [`HashIndex::finish`]) map from window hash to locations.
///
/// Collisions are expected; callers must byte-verify every candidate.
#[derive(Debug, Default)]
pub struct HashIndex {
    uses_es_offsets: bool,
    window_size: usize,
    map: HashMap<u64, Vec<Location>>,
    locations: usize,
}

impl HashIndex {
    pub fn new(uses_es_offsets: bool, window_size: usize) -> Self {
        Self { uses_es_offsets, window_size, map: HashMap::new(), locations: 0 }
    }

    pub fn insert(&mut self, hash: u64, loc: Location) {
        self.map.entry(hash).or_default().push(loc);
        self.locations += 1;
    }

    /// Sort every candidate list by (file, offset) and drop duplicates.
    pub fn finish(&mut self) {
        let mut total = 0usize;
        for locs in self.map.values_mut() {
            locs.sort_unstable();
            locs.dedup();
            locs.shrink_to_fit();
            total += locs.len();
        }
        self.map.shrink_to_fit();
        self.locations = total;
    }

    /// Candidates for `hash`, sorted by (file, offset) once finished.
    pub fn lookup(&self, hash: u64) -> &[Location] {
        self.map.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn uses_es_offsets(&self) -> bool {
        self.uses_es_offsets
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of distinct hashes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn location_count(&self) -> usize {
        self.locations
    }
}
