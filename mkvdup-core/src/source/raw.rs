use super::read_fill;
use super::scanner::SyncScanner;
use super::IndexerConfig;
use crate::error::{Error, Result};
use crate::index::{HashIndex, Location};
use crate::sync::RAW_SCAN_KINDS;
use std::fs::File;
use std::path::Path;
use xxhash_rust::xxh64::Xxh64;

/// Index one file as an opaque blob. Returns `(size, checksum)`.
pub(crate) fn index_raw_file(
    file_idx: u32,
    path: &Path,
    cfg: &IndexerConfig,
    index: &mut HashIndex,
    tick: &mut dyn FnMut(u64),
) -> Result<(u64, u64)> {
    let mut f = File::open(path)
        .map_err(|e| Error::IndexBuild(format!("open {}: {e}", path.display())))?;
    let mut hasher = Xxh64::new(0);
    let mut scanner = SyncScanner::new(RAW_SCAN_KINDS, cfg.window_size);
    let mut emit = |offset: u64, hash: u64| {
        index.insert(hash, Location { file: file_idx, offset, is_video: false, substream: 0 });
    };
    let mut buf = vec![0u8; cfg.read_chunk];
    let mut size = 0u64;
    loop {
        let n = read_fill(&mut f, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        scanner.push(&buf[..n], &mut emit);
        size += n as u64;
        tick(n as u64);
    }
    scanner.finish(&mut emit);
    Ok((size, hasher.digest()))
}
