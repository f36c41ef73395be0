//! Sync-point detection.
//!
//! A sync point is a byte offset that a codec signature marks as a plausible
//! frame or unit boundary. Only sync points are ever hashed by the indexer or
//! looked up by the matcher, so both sides must call the same functions here.

use memchr::memmem;
use serde::{Deserialize, Serialize};

/// Spacing of synthetic sync points inside PCM audio, which has no sync word.
pub const LPCM_SYNC_STRIDE: usize = 512;

const ANNEXB_START_CODE: &[u8] = &[0x00, 0x00, 0x01];
const AC3_SYNC: &[u8] = &[0x0B, 0x77];
const DTS_CORE_SYNC: &[u8] = &[0x7F, 0xFE, 0x80, 0x01];
const DTS_HD_SYNC: &[u8] = &[0x64, 0x58, 0x20, 0x25];
const TRUEHD_MAJOR_SYNC: &[u8] = &[0xF8, 0x72, 0x6F, 0xBA];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    /// AC-3 and E-AC-3 (shared 0x0B77 sync word)
    Ac3,
    /// DTS core and DTS-HD extension substreams
    Dts,
    /// MPEG-1/2 layer I-III
    Mpeg,
    /// AAC with ADTS framing
    Aac,
    TrueHd,
    Lpcm,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Video NAL units / MPEG start codes delimited by `00 00 01`
    AnnexB,
    /// Video NAL units each preceded by a big-endian length of `size_len` bytes
    LengthPrefixed { size_len: u8 },
    Audio(AudioCodec),
    Subtitle,
}

impl StreamKind {
    pub fn is_video(self) -> bool {
        matches!(self, StreamKind::AnnexB | StreamKind::LengthPrefixed { .. })
    }

    /// Length-prefixed boundaries are found by jumping, so scanning a whole
    /// packet costs O(units) rather than O(bytes).
    pub fn is_cheap_to_scan(self) -> bool {
        matches!(self, StreamKind::LengthPrefixed { .. })
    }
}

/// Kinds scanned for when a source file is treated as an opaque blob (DVD layout).
pub const RAW_SCAN_KINDS: &[StreamKind] = &[
    StreamKind::AnnexB,
    StreamKind::Audio(AudioCodec::Ac3),
    StreamKind::Audio(AudioCodec::Dts),
    StreamKind::Audio(AudioCodec::Mpeg),
];

/// Return the ordered boundary offsets inside `data` for a stream of `kind`.
pub fn find_sync_points(data: &[u8], kind: StreamKind) -> Vec<usize> {
    match kind {
        StreamKind::AnnexB => annexb(data),
        StreamKind::LengthPrefixed { size_len } => length_prefixed(data, size_len),
        StreamKind::Audio(codec) => audio(data, codec),
        StreamKind::Subtitle => {
            if data.is_empty() {
                Vec::new()
            } else {
                vec![0]
            }
        }
    }
}

/// Union of the sync points of several kinds, sorted and deduplicated.
pub fn find_sync_points_any(data: &[u8], kinds: &[StreamKind]) -> Vec<usize> {
    let mut out: Vec<usize> = Vec::new();
    for &kind in kinds {
        out.extend(find_sync_points(data, kind));
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Offsets in a container packet of PCM audio at which an indexed stride
/// point may fall.
///
/// The packet's stream offset is a multiple of `frame_bytes` but otherwise
/// unknown, so every offset aligned to `gcd(frame_bytes, LPCM_SYNC_STRIDE)`
/// is a candidate. An unknown frame size makes every byte a candidate.
pub fn pcm_candidate_points(len: usize, frame_bytes: Option<usize>) -> Vec<usize> {
    let step = gcd(frame_bytes.unwrap_or(1).max(1), LPCM_SYNC_STRIDE);
    (0..len).step_by(step).collect()
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// The point after the start code is used so that Annex-B and
/// length-prefixed renditions of the same NAL unit share an offset.
fn annexb(data: &[u8]) -> Vec<usize> {
    memmem::find_iter(data, ANNEXB_START_CODE)
        .map(|p| p + ANNEXB_START_CODE.len())
        .filter(|&p| p < data.len())
        .collect()
}

fn length_prefixed(data: &[u8], size_len: u8) -> Vec<usize> {
    let n = match size_len {
        1..=4 => size_len as usize,
        _ => 4,
    };
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + n <= data.len() {
        let len = data[pos..pos + n].iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
        let start = pos + n;
        if len == 0 || start >= data.len() {
            break;
        }
        out.push(start);
        pos = match start.checked_add(len) {
            Some(next) => next,
            None => break,
        };
    }
    out
}

fn audio(data: &[u8], codec: AudioCodec) -> Vec<usize> {
    match codec {
        AudioCodec::Ac3 => memmem::find_iter(data, AC3_SYNC).collect(),
        AudioCodec::Dts => {
            let mut v: Vec<usize> = memmem::find_iter(data, DTS_CORE_SYNC).collect();
            v.extend(memmem::find_iter(data, DTS_HD_SYNC));
            v.sort_unstable();
            v
        }
        AudioCodec::Mpeg => memchr::memchr_iter(0xFF, data)
            .filter(|&i| i + 2 < data.len() && is_mpa_header(data[i + 1], data[i + 2]))
            .collect(),
        AudioCodec::Aac => memchr::memchr_iter(0xFF, data)
            .filter(|&i| i + 1 < data.len() && data[i + 1] & 0xF6 == 0xF0)
            .collect(),
        // The access-unit header precedes the major sync by four bytes.
        AudioCodec::TrueHd => memmem::find_iter(data, TRUEHD_MAJOR_SYNC)
            .filter(|&p| p >= 4)
            .map(|p| p - 4)
            .collect(),
        AudioCodec::Lpcm => (0..data.len()).step_by(LPCM_SYNC_STRIDE).collect(),
        AudioCodec::Other => Vec::new(),
    }
}

fn is_mpa_header(b1: u8, b2: u8) -> bool {
    let frame_sync = b1 & 0xE0 == 0xE0;
    let version_ok = (b1 >> 3) & 0x03 != 0x01;
    let layer_ok = (b1 >> 1) & 0x03 != 0x00;
    let bitrate_ok = b2 >> 4 != 0x0F;
    let rate_ok = (b2 >> 2) & 0x03 != 0x03;
    frame_sync && version_ok && layer_ok && bitrate_ok && rate_ok
}
