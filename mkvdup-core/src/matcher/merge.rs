use super::delta::DeltaSpool;
use crate::entry::Entry;
use crate::error::Result;
use crate::rangemap::LpcmFormat;
use std::cmp::Reverse;

/// A verified mapping of container bytes `[mkv_start, mkv_end)` onto a
/// source byte space starting at `src_offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MatchedRegion {
    pub mkv_start: u64,
    pub mkv_end: u64,
    pub file: u32,
    pub src_offset: u64,
    pub is_video: bool,
    pub substream: u8,
}

impl MatchedRegion {
    pub fn len(&self) -> u64 {
        self.mkv_end - self.mkv_start
    }

    pub fn is_empty(&self) -> bool {
        self.mkv_end <= self.mkv_start
    }

    /// Does `other` (starting at or after `self`) continue the same linear mapping?
    fn continues(&self, other: &MatchedRegion) -> bool {
        self.file == other.file
            && self.is_video == other.is_video
            && self.substream == other.substream
            && other.mkv_start >= self.mkv_start
            && self.src_offset.checked_add(other.mkv_start - self.mkv_start)
                == Some(other.src_offset)
    }
}

/// Resolve overlaps between matched regions.
///
/// Regions are ordered by start offset, longer first on ties. Overlapping or
/// adjacent regions with a consistent mapping coalesce; on an inconsistent
/// overlap the earlier region keeps its bytes and the later one is clipped
/// to start where the earlier ends (or dropped when nothing is left).
pub fn merge_regions(mut regions: Vec<MatchedRegion>) -> Vec<MatchedRegion> {
    regions.retain(|r| !r.is_empty());
    regions.sort_unstable_by_key(|r| {
        (r.mkv_start, Reverse(r.len()), r.file, r.src_offset, r.is_video, r.substream)
    });
    let mut out: Vec<MatchedRegion> = Vec::with_capacity(regions.len());
    for mut r in regions {
        let Some(last) = out.last_mut() else {
            out.push(r);
            continue;
        };
        if r.mkv_start <= last.mkv_end && last.continues(&r) {
            last.mkv_end = last.mkv_end.max(r.mkv_end);
            continue;
        }
        if r.mkv_start < last.mkv_end {
            if r.mkv_end <= last.mkv_end {
                continue;
            }
            let cut = last.mkv_end - r.mkv_start;
            r.mkv_start += cut;
            r.src_offset += cut;
        }
        out.push(r);
    }
    out
}

/// Tile `[0, total_len)` with source entries for `regions` and delta entries
/// for every gap, appending gap bytes from `mkv` to `spool`.
///
/// `regions` must come from [`merge_regions`]. `lpcm_of` supplies the sample
/// layout for regions drawn from byte-swapped PCM streams.
pub fn build_entries(
    regions: &[MatchedRegion],
    mkv: &[u8],
    lpcm_of: &dyn Fn(&MatchedRegion) -> Option<LpcmFormat>,
    spool: &mut DeltaSpool,
) -> Result<Vec<Entry>> {
    let total = mkv.len() as u64;
    let mut entries = Vec::with_capacity(regions.len() * 2 + 1);
    let mut pos = 0u64;
    let mut push_gap = |entries: &mut Vec<Entry>, from: u64, to: u64| -> Result<()> {
        if to > from {
            let at = spool.append(&mkv[from as usize..to as usize])?;
            entries.push(Entry::delta(from, to - from, at));
        }
        Ok(())
    };
    for r in regions {
        let end = r.mkv_end.min(total);
        if end <= r.mkv_start {
            continue;
        }
        push_gap(&mut entries, pos, r.mkv_start)?;
        entries.push(Entry {
            mkv_offset: r.mkv_start,
            length: end - r.mkv_start,
            source: r.file + 1,
            source_offset: r.src_offset,
            is_video: r.is_video,
            substream: r.substream,
            lpcm: lpcm_of(r),
        });
        pos = end;
    }
    push_gap(&mut entries, pos, total)?;
    Ok(entries)
}
