//! Per-packet candidate search, byte verification and bidirectional expansion.

use super::coverage::CoverageBitmap;
use super::hint::TrackHints;
use super::merge::MatchedRegion;
use super::MatcherConfig;
use crate::container::Packet;
use crate::error::Result;
use crate::index::{window_hash, HashIndex, Location};
use crate::source::{SourceData, SourceRead, StreamRef};
use crate::sync::{find_sync_points, pcm_candidate_points, AudioCodec, StreamKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Clone, Copy)]
pub(crate) struct TrackInfo {
    pub slot: usize,
    pub kind: StreamKind,
    /// Frame size of a PCM track, when the container reports its layout
    pub pcm_frame: Option<usize>,
}

impl TrackInfo {
    fn sync_points(&self, data: &[u8]) -> Vec<usize> {
        match self.kind {
            StreamKind::Audio(AudioCodec::Lpcm) => pcm_candidate_points(data.len(), self.pcm_frame),
            kind => find_sync_points(data, kind),
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub packets_matched: AtomicU64,
    pub packets_skipped: AtomicU64,
    pub regions: AtomicU64,
    pub phase1_verifications: AtomicU64,
    pub phase1_accepts: AtomicU64,
    pub phase2_searches: AtomicU64,
    pub phase2_verifications: AtomicU64,
    pub verify_misses: AtomicU64,
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

/// Per-worker reusable buffers, so verification does not allocate per candidate.
pub(crate) struct Scratch {
    buf: Vec<u8>,
}

impl Scratch {
    pub(crate) fn new(cfg: &MatcherConfig, window: usize) -> Self {
        Self { buf: vec![0u8; cfg.compare_chunk.max(window)] }
    }
}

/// Read-only view plus shared state handed to every worker.
pub(crate) struct MatchContext<'a> {
    pub mkv: &'a [u8],
    pub index: &'a HashIndex,
    pub source: &'a SourceData,
    pub cfg: &'a MatcherConfig,
    pub tracks: &'a HashMap<u64, TrackInfo>,
    pub coverage: &'a CoverageBitmap,
    pub hints: &'a TrackHints,
    pub regions: &'a Mutex<Vec<MatchedRegion>>,
    pub counters: &'a Counters,
}

struct PacketSpan {
    start: u64,
    end: u64,
    slot: usize,
    video: bool,
}

impl MatchContext<'_> {
    /// Source read failures abort the run rather than count as mismatches.
    pub(crate) fn match_packet(&self, scratch: &mut Scratch, pkt: &Packet) -> Result<()> {
        let Some(info) = self.tracks.get(&pkt.track).copied() else {
            return Ok(());
        };
        let total = self.mkv.len() as u64;
        let start = pkt.offset.min(total);
        let end = pkt.end().min(total);
        if end <= start {
            return Ok(());
        }
        if self.coverage.is_covered(start, end) {
            bump(&self.counters.packets_skipped);
            return Ok(());
        }
        let data = &self.mkv[start as usize..end as usize];
        let span = PacketSpan { start, end, slot: info.slot, video: info.kind.is_video() };

        let prefix = if info.kind.is_cheap_to_scan() {
            data.len()
        } else {
            data.len().min(self.cfg.prefix_scan)
        };
        let first = info.sync_points(&data[..prefix]);
        let mut covered_to = 0usize;
        let mut found = self.look_up_points(scratch, &span, data, &first, &mut covered_to)?;

        if prefix < data.len() && covered_to < data.len() {
            let rest: Vec<usize> = info
                .sync_points(data)
                .into_iter()
                .filter(|p| first.binary_search(p).is_err())
                .collect();
            found |= self.look_up_points(scratch, &span, data, &rest, &mut covered_to)?;
        }
        if found {
            bump(&self.counters.packets_matched);
        }
        Ok(())
    }

    /// Hash and look up each sync point in `points` not already covered.
    fn look_up_points(
        &self,
        scratch: &mut Scratch,
        span: &PacketSpan,
        data: &[u8],
        points: &[usize],
        covered_to: &mut usize,
    ) -> Result<bool> {
        let window = self.index.window_size();
        let mut found = false;
        for &p in points {
            if p < *covered_to {
                continue;
            }
            if p + window > data.len() {
                break;
            }
            let abs = span.start + p as u64;
            if self.coverage.is_covered(abs, abs + window as u64) {
                continue;
            }
            let w = &data[p..p + window];
            let cands = self.index.lookup(window_hash(w));
            if cands.is_empty() {
                continue;
            }
            if let Some(region) = self.search(scratch, span, abs, w, cands)? {
                let rel_end = (region.mkv_end - span.start).min(data.len() as u64) as usize;
                *covered_to = (*covered_to).max(rel_end);
                self.record(span.slot, region);
                found = true;
            }
        }
        Ok(found)
    }

    /// Two-phase search: the K candidates nearest the track hint first, then
    /// all remaining candidates, keeping the longest expansion.
    fn search(
        &self,
        scratch: &mut Scratch,
        span: &PacketSpan,
        abs: u64,
        w: &[u8],
        cands: &[Location],
    ) -> Result<Option<MatchedRegion>> {
        let es = self.index.uses_es_offsets();
        let eligible = |loc: &Location| !es || loc.is_video == span.video;
        let mut best: Option<MatchedRegion> = None;
        let keep = |r: MatchedRegion, best: &mut Option<MatchedRegion>| {
            if best.map_or(true, |b| r.len() > b.len()) {
                *best = Some(r);
            }
        };

        let mut tried: Vec<usize> = Vec::new();
        if let Some(hint) = self.hints.get(span.slot) {
            tried = nearest(cands, hint, self.cfg.hint_neighbours);
            for &i in &tried {
                let loc = &cands[i];
                if !eligible(loc) {
                    continue;
                }
                bump(&self.counters.phase1_verifications);
                if let Some(r) = self.verify_expand(scratch, abs, w, loc)? {
                    keep(r, &mut best);
                }
            }
            if let Some(b) = best {
                let whole = b.mkv_start <= span.start && b.mkv_end >= span.end;
                if b.len() >= self.cfg.good_match_len || whole {
                    bump(&self.counters.phase1_accepts);
                    return Ok(best);
                }
            }
            tried.sort_unstable();
        }

        bump(&self.counters.phase2_searches);
        for (i, loc) in cands.iter().enumerate() {
            if !eligible(loc) || tried.binary_search(&i).is_ok() {
                continue;
            }
            bump(&self.counters.phase2_verifications);
            if let Some(r) = self.verify_expand(scratch, abs, w, loc)? {
                keep(r, &mut best);
            }
        }
        Ok(best)
    }

    fn record(&self, slot: usize, region: MatchedRegion) {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner).push(region);
        bump(&self.counters.regions);
        self.hints.set(slot, region.file, region.src_offset + region.len() / 2);
        self.coverage.mark(region.mkv_start, region.mkv_end);
    }

    /// Byte-compare the window at `loc`, then grow the match both ways.
    fn verify_expand(
        &self,
        scratch: &mut Scratch,
        abs: u64,
        w: &[u8],
        loc: &Location,
    ) -> Result<Option<MatchedRegion>> {
        let stream = StreamRef::from(loc);
        let window = w.len() as u64;
        if self.common_prefix_at(scratch, stream, abs, loc.offset, window)? < window {
            bump(&self.counters.verify_misses);
            return Ok(None);
        }
        let src_len = self.source.stream_len(stream)?;
        let mkv_len = self.mkv.len() as u64;
        let fwd_max = self
            .cfg
            .max_expand
            .min(mkv_len - (abs + window))
            .min(src_len.saturating_sub(loc.offset + window));
        let fwd =
            self.common_prefix_at(scratch, stream, abs + window, loc.offset + window, fwd_max)?;
        let back_max = self.cfg.max_expand.min(abs).min(loc.offset);
        let back = self.common_suffix_before(scratch, stream, abs, loc.offset, back_max)?;
        Ok(Some(MatchedRegion {
            mkv_start: abs - back,
            mkv_end: abs + window + fwd,
            file: loc.file,
            src_offset: loc.offset - back,
            is_video: loc.is_video,
            substream: loc.substream,
        }))
    }

    /// Source bytes at `offset`, zero-copy for raw sources, else read into scratch.
    fn source_bytes<'s>(
        &'s self,
        scratch: &'s mut Scratch,
        stream: StreamRef,
        offset: u64,
        n: usize,
    ) -> Result<&'s [u8]> {
        if let Some(s) = self.source.slice(stream, offset, n) {
            return Ok(s);
        }
        let buf = &mut scratch.buf[..n];
        let got = self.source.read_at(stream, offset, buf)?;
        Ok(&scratch.buf[..got])
    }

    /// Length of the common run going forward from `mkv_pos` / `src_pos`, up to `max`.
    fn common_prefix_at(
        &self,
        scratch: &mut Scratch,
        stream: StreamRef,
        mkv_pos: u64,
        src_pos: u64,
        max: u64,
    ) -> Result<u64> {
        let chunk = scratch.buf.len() as u64;
        let mut done = 0u64;
        while done < max {
            let n = chunk.min(max - done) as usize;
            let m0 = (mkv_pos + done) as usize;
            let m = &self.mkv[m0..m0 + n];
            let s = self.source_bytes(scratch, stream, src_pos + done, n)?;
            let k = if m == s {
                n
            } else {
                m.iter().zip(s).position(|(a, b)| a != b).unwrap_or(m.len().min(s.len()))
            };
            done += k as u64;
            if k < n {
                break;
            }
        }
        Ok(done)
    }

    /// Length of the common run going backward from just before `mkv_pos` / `src_pos`.
    fn common_suffix_before(
        &self,
        scratch: &mut Scratch,
        stream: StreamRef,
        mkv_pos: u64,
        src_pos: u64,
        max: u64,
    ) -> Result<u64> {
        let chunk = scratch.buf.len() as u64;
        let mut done = 0u64;
        while done < max {
            let n = chunk.min(max - done);
            let m_end = (mkv_pos - done) as usize;
            let m = &self.mkv[m_end - n as usize..m_end];
            let s = self.source_bytes(scratch, stream, src_pos - done - n, n as usize)?;
            if s.len() != m.len() {
                break;
            }
            let k = m
                .iter()
                .rev()
                .zip(s.iter().rev())
                .position(|(a, b)| a != b)
                .unwrap_or(m.len());
            done += k as u64;
            if (k as u64) < n {
                break;
            }
        }
        Ok(done)
    }
}

/// Indices of the `k` candidates closest to `hint`. Candidates in other files
/// rank behind every same-file candidate.
fn nearest(cands: &[Location], hint: (u32, u64), k: usize) -> Vec<usize> {
    let dist = |l: &Location| if l.file == hint.0 { l.offset.abs_diff(hint.1) } else { u64::MAX };
    let pos = cands.partition_point(|l| (l.file, l.offset) < hint);
    let (mut lo, mut hi) = (pos, pos);
    let mut out = Vec::with_capacity(k.min(cands.len()));
    while out.len() < k && (lo > 0 || hi < cands.len()) {
        let left = (lo > 0).then(|| dist(&cands[lo - 1]));
        let right = (hi < cands.len()).then(|| dist(&cands[hi]));
        match (left, right) {
            (Some(l), Some(r)) if l <= r => {
                lo -= 1;
                out.push(lo);
            }
            (Some(_), None) => {
                lo -= 1;
                out.push(lo);
            }
            _ => {
                out.push(hi);
                hi += 1;
            }
        }
    }
    out
}
