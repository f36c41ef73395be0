//! Aligns container packets with indexed source bytes.
//!
//! Workers from a fixed-size pool take packets independently. Shared state is
//! limited to the coverage bitmap, the append-only region list and the
//! per-track locality hints; everything else is read-only for the run.

mod coverage;
mod delta;
mod hint;
mod merge;
mod search;

pub use coverage::{CoverageBitmap, COVERAGE_CHUNK};
pub use delta::DeltaSpool;
pub use merge::{build_entries, merge_regions, MatchedRegion};

use crate::container::{codec_warnings, PacketList};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::source::{SourceIndex, StreamRef};
use hint::TrackHints;
use memmap2::Mmap;
use rayon::prelude::*;
use search::{Counters, MatchContext, Scratch, TrackInfo};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct MatcherConfig {
    pub workers: usize,
    /// Bytes of a packet scanned for sync points before falling back to a full scan
    pub prefix_scan: usize,
    /// A phase-1 expansion at least this long is accepted without an exhaustive search
    pub good_match_len: u64,
    /// Candidates nearest the locality hint tried in phase 1
    pub hint_neighbours: usize,
    /// Expansion cap in each direction
    pub max_expand: u64,
    pub compare_chunk: usize,
    /// In-memory size of the delta spool before it moves to a temp file
    pub delta_spool_mem: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        Self {
            workers: (cpus / 2).max(1),
            prefix_scan: 4096,
            good_match_len: 64 << 10,
            hint_neighbours: 8,
            max_expand: 16 << 20,
            compare_chunk: 4096,
            delta_spool_mem: 64 << 20,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MatchStats {
    pub packets: u64,
    pub packets_matched: u64,
    pub packets_skipped_covered: u64,
    pub regions_found: u64,
    pub regions_merged: u64,
    pub phase1_verifications: u64,
    pub phase1_accepts: u64,
    pub phase2_searches: u64,
    pub phase2_verifications: u64,
    pub verify_misses: u64,
    pub source_entries: u64,
    pub delta_entries: u64,
    pub matched_bytes: u64,
    pub unmatched_bytes: u64,
}

/// Everything the artifact writer needs from one matching run.
pub struct MatchResult {
    pub original_size: u64,
    pub original_checksum: u64,
    pub entries: Vec<Entry>,
    pub delta: DeltaSpool,
    pub stats: MatchStats,
    pub warnings: Vec<String>,
}

impl MatchResult {
    pub fn matched_bytes(&self) -> u64 {
        self.stats.matched_bytes
    }

    pub fn unmatched_bytes(&self) -> u64 {
        self.stats.unmatched_bytes
    }
}

/// Container bytes, mapped for the duration of a run.
struct MappedContainer {
    mmap: Option<Mmap>,
}

impl MappedContainer {
    fn open(path: &Path) -> Result<Self> {
        let f = File::open(path)?;
        let len = f.metadata()?.len();
        if len == 0 {
            return Ok(Self { mmap: None });
        }
        // The container must not be modified while a run is in progress.
        let mmap = unsafe { Mmap::map(&f)? };
        Ok(Self { mmap: Some(mmap) })
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

/// Match the container at `mkv_path` against `source`.
pub fn match_container(
    mkv_path: &Path,
    packets: &PacketList,
    source: &SourceIndex,
    cfg: &MatcherConfig,
    progress: Option<&Progress>,
) -> Result<MatchResult> {
    let container = MappedContainer::open(mkv_path)?;
    match_bytes(container.bytes(), packets, source, cfg, progress)
}

/// Match already-loaded container bytes. `mkv` must stay unchanged for the call.
pub fn match_bytes(
    mkv: &[u8],
    packets: &PacketList,
    source: &SourceIndex,
    cfg: &MatcherConfig,
    progress: Option<&Progress>,
) -> Result<MatchResult> {
    if cfg.workers == 0 || cfg.compare_chunk == 0 {
        return Err(Error::InvalidInput("workers and compare chunk must be non-zero".into()));
    }
    packets.validate()?;
    let warnings = codec_warnings(source.layout, &packets.tracks);
    for w in &warnings {
        warn!("{w}");
    }

    let data = source.open_data()?;
    let tracks: HashMap<u64, TrackInfo> = packets
        .tracks
        .iter()
        .enumerate()
        .map(|(slot, t)| {
            let info = TrackInfo { slot, kind: t.stream_kind(), pcm_frame: t.pcm_frame_bytes() };
            (t.number, info)
        })
        .collect();
    let coverage = CoverageBitmap::new(mkv.len() as u64);
    let hints = TrackHints::new(packets.tracks.len());
    let regions = Mutex::new(Vec::new());
    let counters = Counters::default();
    let ctx = MatchContext {
        mkv,
        index: &source.index,
        source: &data,
        cfg,
        tracks: &tracks,
        coverage: &coverage,
        hints: &hints,
        regions: &regions,
        counters: &counters,
    };

    if let Some(p) = progress {
        p.set_stage("match");
        p.set_items_total(packets.packets.len() as u64);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.workers)
        .thread_name(|i| format!("mkvdup-match-{i}"))
        .build()
        .map_err(|e| Error::InvalidInput(format!("worker pool: {e}")))?;
    let window = source.index.window_size();
    let (checksum, scan) = pool.install(|| {
        rayon::join(
            || xxhash_rust::xxh64::xxh64(mkv, 0),
            || {
                packets.packets.par_iter().try_for_each_init(
                    || Scratch::new(cfg, window),
                    |scratch, pkt| -> Result<()> {
                        ctx.match_packet(scratch, pkt)?;
                        if let Some(p) = progress {
                            p.inc_item();
                        }
                        Ok(())
                    },
                )
            },
        )
    });
    scan?;

    let found = regions.into_inner().unwrap_or_else(PoisonError::into_inner);
    let regions_found = found.len() as u64;
    let merged = merge_regions(found);
    debug!(found = regions_found, merged = merged.len(), "regions merged");

    let mut delta = DeltaSpool::new(cfg.delta_spool_mem);
    let lpcm_of = |r: &MatchedRegion| {
        data.lpcm(StreamRef { file: r.file, is_video: r.is_video, substream: r.substream })
    };
    let entries = build_entries(&merged, mkv, &lpcm_of, &mut delta)?;

    let unmatched = delta.len();
    let stats = MatchStats {
        packets: packets.packets.len() as u64,
        packets_matched: counters.packets_matched.load(Ordering::Relaxed),
        packets_skipped_covered: counters.packets_skipped.load(Ordering::Relaxed),
        regions_found,
        regions_merged: merged.len() as u64,
        phase1_verifications: counters.phase1_verifications.load(Ordering::Relaxed),
        phase1_accepts: counters.phase1_accepts.load(Ordering::Relaxed),
        phase2_searches: counters.phase2_searches.load(Ordering::Relaxed),
        phase2_verifications: counters.phase2_verifications.load(Ordering::Relaxed),
        verify_misses: counters.verify_misses.load(Ordering::Relaxed),
        source_entries: entries.iter().filter(|e| !e.is_delta()).count() as u64,
        delta_entries: entries.iter().filter(|e| e.is_delta()).count() as u64,
        matched_bytes: mkv.len() as u64 - unmatched,
        unmatched_bytes: unmatched,
    };
    info!(
        size = mkv.len(),
        matched = stats.matched_bytes,
        unmatched = stats.unmatched_bytes,
        entries = entries.len(),
        delta_on_disk = delta.is_on_disk(),
        "matching done"
    );
    Ok(MatchResult {
        original_size: mkv.len() as u64,
        original_checksum: checksum,
        entries,
        delta,
        stats,
        warnings,
    })
}
