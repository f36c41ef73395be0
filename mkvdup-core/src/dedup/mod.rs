//! The dedup artifact: binary format, writer and random-access reader.

mod format;
mod reader;
mod writer;

pub use format::{Footer, Header, FOOTER_LEN, HEADER_CHECKED_LEN, HEADER_LEN, VERSION};
pub use reader::{DedupFile, DedupSummary, Reconstructor};
pub use writer::{DedupWriter, WriteSummary};

/// Creator identity recorded when none is given.
pub const DEFAULT_CREATOR: &str = concat!("mkvdup ", env!("CARGO_PKG_VERSION"));

/// Decode bounds applied when opening an untrusted artifact.
#[derive(Clone, Copy, Debug)]
pub struct ReadLimits {
    pub max_entries: u64,
    pub max_sources: u64,
    /// Upper bound on the decompressed range-map section
    pub max_range_map_bytes: u64,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self { max_entries: 100_000_000, max_sources: 100_000, max_range_map_bytes: 1 << 30 }
    }
}
