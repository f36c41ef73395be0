//! Elementary-stream to raw-container offset translation.
//!
//! Transport streams interleave streams and pad to fixed packet sizes, so a
//! contiguous run of ES bytes maps onto many short raw ranges. Ranges are
//! stored as runs of equally sized pieces at a fixed raw stride, which
//! collapses bursts of consecutive transport packets into one record.

use crate::error::{Error, Result};
use crate::sync::StreamKind;
use serde::{Deserialize, Serialize};

/// `count` pieces of `piece_len` bytes; piece `i` covers ES
/// `[es_start + i*piece_len, +piece_len)` and raw
/// `[raw_start + i*raw_stride, +piece_len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRun {
    pub es_start: u64,
    pub raw_start: u64,
    pub piece_len: u32,
    pub raw_stride: u32,
    pub count: u32,
}

impl RangeRun {
    pub fn es_len(&self) -> u64 {
        self.piece_len as u64 * self.count as u64
    }

    pub fn es_end(&self) -> u64 {
        self.es_start + self.es_len()
    }

    fn next_raw(&self) -> u64 {
        self.raw_start + self.count as u64 * self.raw_stride as u64
    }
}

/// Ordered, non-overlapping ES↔raw ranges of one stream in one file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMap {
    runs: Vec<RangeRun>,
    es_len: u64,
}

impl RangeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next `len` ES bytes, which were read from raw offset `raw_start`.
    pub fn push(&mut self, raw_start: u64, len: u32) {
        if len == 0 {
            return;
        }
        let es_start = self.es_len;
        self.es_len += len as u64;
        if let Some(last) = self.runs.last_mut() {
            if last.count == 1 && raw_start == last.raw_start + last.piece_len as u64 {
                if let Some(merged) = last.piece_len.checked_add(len) {
                    last.piece_len = merged;
                    last.raw_stride = merged;
                    return;
                }
            }
            if len == last.piece_len && last.count < u32::MAX {
                if last.count == 1 && raw_start > last.raw_start {
                    let stride = raw_start - last.raw_start;
                    if stride >= len as u64 && stride <= u32::MAX as u64 {
                        last.raw_stride = stride as u32;
                        last.count = 2;
                        return;
                    }
                } else if last.count >= 2 && raw_start == last.next_raw() {
                    last.count += 1;
                    return;
                }
            }
        }
        self.runs.push(RangeRun { es_start, raw_start, piece_len: len, raw_stride: len, count: 1 });
    }

    /// Total number of ES bytes mapped.
    pub fn es_len(&self) -> u64 {
        self.es_len
    }

    pub fn runs(&self) -> &[RangeRun] {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Reject runs that are empty, unsorted, overlapping in raw space or
    /// overflowing. Decoded maps must pass this before any translation.
    pub fn validate(&self) -> Result<()> {
        let mut es = 0u64;
        for (i, r) in self.runs.iter().enumerate() {
            let bad = |why: &str| Err(Error::CorruptFormat(format!("range run {i}: {why}")));
            if r.piece_len == 0 || r.count == 0 {
                return bad("empty run");
            }
            if r.raw_stride < r.piece_len {
                return bad("stride shorter than piece");
            }
            if r.es_start != es {
                return bad("ES offsets not contiguous");
            }
            let raw_end = (r.count as u64 - 1)
                .checked_mul(r.raw_stride as u64)
                .and_then(|v| v.checked_add(r.raw_start))
                .and_then(|v| v.checked_add(r.piece_len as u64));
            if raw_end.is_none() {
                return bad("raw range overflows");
            }
            es = match es.checked_add(r.es_len()) {
                Some(v) => v,
                None => return bad("ES length overflows"),
            };
        }
        if es != self.es_len {
            return Err(Error::CorruptFormat(format!(
                "range runs cover {es} ES bytes, map claims {}",
                self.es_len
            )));
        }
        Ok(())
    }

    /// Raw `(offset, len)` spans holding ES bytes `[es_start, es_start+len)`,
    /// in ES order. Physically adjacent spans are coalesced. `None` when the
    /// requested range runs past the end of the stream.
    pub fn translate(&self, es_start: u64, len: u64) -> Option<Vec<(u64, u64)>> {
        let end = es_start.checked_add(len)?;
        if end > self.es_len {
            return None;
        }
        let mut spans: Vec<(u64, u64)> = Vec::new();
        let mut pos = es_start;
        let mut idx = self.runs.partition_point(|r| r.es_end() <= pos);
        while pos < end {
            let run = self.runs.get(idx)?;
            let piece_len = run.piece_len as u64;
            if piece_len == 0 || pos < run.es_start {
                return None;
            }
            let piece = (pos - run.es_start) / piece_len;
            let within = (pos - run.es_start) % piece_len;
            let raw = run.raw_start + piece * run.raw_stride as u64 + within;
            let take = (piece_len - within).min(end - pos);
            match spans.last_mut() {
                Some(last) if last.0 + last.1 == raw => last.1 += take,
                _ => spans.push((raw, take)),
            }
            pos += take;
            if pos >= run.es_end() {
                idx += 1;
            }
        }
        Some(spans)
    }
}

/// Sample layout of a PCM stream.
///
/// Discs store samples big-endian and pad odd channel counts with one unused
/// channel per frame. The indexed form of such a stream is the container
/// layout: samples byte-swapped, padding dropped. `channels` counts audible
/// channels only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LpcmFormat {
    pub bits: u8,
    pub channels: u8,
}

impl LpcmFormat {
    pub fn is_valid(&self) -> bool {
        matches!(self.bits, 16 | 20 | 24) && (1..=8).contains(&self.channels)
    }

    /// Bytes per sample; 20-bit samples travel in 24-bit containers.
    pub fn sample_bytes(&self) -> usize {
        if self.bits <= 16 {
            2
        } else {
            3
        }
    }

    /// Channels per frame on disc, padding included.
    pub fn stored_channels(&self) -> usize {
        let c = self.channels as usize;
        c + (c & 1)
    }

    /// Bytes per frame in the indexed (container) layout.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.sample_bytes()
    }

    pub fn stored_frame_bytes(&self) -> usize {
        self.stored_channels() * self.sample_bytes()
    }

    /// Indexed length of a stream holding `stored` bytes on disc.
    pub fn indexed_len(&self, stored: u64) -> u64 {
        let (pf, uf) = (self.stored_frame_bytes() as u64, self.frame_bytes() as u64);
        stored / pf * uf + (stored % pf).min(uf)
    }

    /// Append the indexed form of `stored`, which must begin on a frame
    /// boundary. A trailing partial sample is copied unswapped.
    pub fn normalize(&self, stored: &[u8], out: &mut Vec<u8>) {
        let (pf, uf) = (self.stored_frame_bytes(), self.frame_bytes());
        let start = out.len();
        for frame in stored.chunks(pf) {
            out.extend_from_slice(&frame[..frame.len().min(uf)]);
        }
        swap_sample_bytes(&mut out[start..], self.sample_bytes());
    }
}

/// Reverse the byte order of every whole sample in `buf`.
pub fn swap_sample_bytes(buf: &mut [u8], sample_bytes: usize) {
    if sample_bytes < 2 {
        return;
    }
    for sample in buf.chunks_exact_mut(sample_bytes) {
        sample.reverse();
    }
}

/// Range map and metadata for one stream of one source file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMap {
    pub is_video: bool,
    pub substream: u8,
    pub kind: StreamKind,
    pub lpcm: Option<LpcmFormat>,
    pub ranges: RangeMap,
}

/// All stream maps of one source file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRangeMap {
    pub file: u32,
    pub streams: Vec<StreamMap>,
}

impl FileRangeMap {
    pub fn stream(&self, is_video: bool, substream: u8) -> Option<&StreamMap> {
        self.streams
            .iter()
            .find(|s| s.is_video == is_video && (is_video || s.substream == substream))
    }
}
