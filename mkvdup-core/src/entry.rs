use crate::error::{Error, Result};
use crate::rangemap::LpcmFormat;
use serde::{Deserialize, Serialize};

/// Size of one encoded entry record.
pub const ENTRY_SIZE: usize = 32;

const FLAG_VIDEO: u8 = 0x01;
const FLAG_LPCM: u8 = 0x02;
const KNOWN_FLAGS: u8 = FLAG_VIDEO | FLAG_LPCM;

/// One contiguous run of the original container.
///
/// `source == 0` means the bytes live in the delta blob at `source_offset`;
/// otherwise they come from source file `source - 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub mkv_offset: u64,
    pub length: u64,
    pub source: u32,
    pub source_offset: u64,
    pub is_video: bool,
    pub substream: u8,
    pub lpcm: Option<LpcmFormat>,
}

impl Entry {
    pub fn delta(mkv_offset: u64, length: u64, delta_offset: u64) -> Self {
        Self {
            mkv_offset,
            length,
            source: 0,
            source_offset: delta_offset,
            is_video: false,
            substream: 0,
            lpcm: None,
        }
    }

    pub fn is_delta(&self) -> bool {
        self.source == 0
    }

    /// Index into the source table, for source entries.
    pub fn source_file(&self) -> Option<u32> {
        self.source.checked_sub(1)
    }

    pub fn mkv_end(&self) -> u64 {
        self.mkv_offset + self.length
    }

    /// Layout: mkv_offset u64 | length u64 | source_offset u64 | source u32 |
    /// flags u8 | substream u8 | lpcm bits u8 | lpcm channels u8, all LE.
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0..8].copy_from_slice(&self.mkv_offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.length.to_le_bytes());
        out[16..24].copy_from_slice(&self.source_offset.to_le_bytes());
        out[24..28].copy_from_slice(&self.source.to_le_bytes());
        let mut flags = 0u8;
        if self.is_video {
            flags |= FLAG_VIDEO;
        }
        if let Some(fmt) = self.lpcm {
            flags |= FLAG_LPCM;
            out[30] = fmt.bits;
            out[31] = fmt.channels;
        }
        out[28] = flags;
        out[29] = self.substream;
        out
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < ENTRY_SIZE {
            return Err(Error::CorruptFormat("truncated entry".into()));
        }
        let u64_at = |i: usize| {
            let mut a = [0u8; 8];
            a.copy_from_slice(&b[i..i + 8]);
            u64::from_le_bytes(a)
        };
        let mut s4 = [0u8; 4];
        s4.copy_from_slice(&b[24..28]);
        let flags = b[28];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(Error::CorruptFormat(format!("unknown entry flags {flags:#04x}")));
        }
        let lpcm = (flags & FLAG_LPCM != 0).then_some(LpcmFormat { bits: b[30], channels: b[31] });
        if lpcm.is_some_and(|fmt| !fmt.is_valid()) {
            return Err(Error::CorruptFormat(format!("entry has invalid PCM layout {:?}", lpcm)));
        }
        Ok(Self {
            mkv_offset: u64_at(0),
            length: u64_at(8),
            source_offset: u64_at(16),
            source: u32::from_le_bytes(s4),
            is_video: flags & FLAG_VIDEO != 0,
            substream: b[29],
            lpcm,
        })
    }
}

/// Check that `entries` tile `[0, original_size)` exactly and that delta
/// entries index the delta blob contiguously from zero. Returns the delta length.
pub fn check_partition(entries: &[Entry], original_size: u64) -> Result<u64> {
    let mut pos = 0u64;
    let mut delta_pos = 0u64;
    for (i, e) in entries.iter().enumerate() {
        if e.length == 0 {
            return Err(Error::CorruptFormat(format!("entry {i} is empty")));
        }
        if e.mkv_offset != pos {
            return Err(Error::CorruptFormat(format!(
                "entry {i} starts at {}, expected {pos}",
                e.mkv_offset
            )));
        }
        if e.is_delta() {
            if e.source_offset != delta_pos {
                return Err(Error::CorruptFormat(format!(
                    "delta entry {i} at blob offset {}, expected {delta_pos}",
                    e.source_offset
                )));
            }
            delta_pos += e.length;
        }
        pos = e
            .mkv_offset
            .checked_add(e.length)
            .ok_or_else(|| Error::CorruptFormat(format!("entry {i} overflows")))?;
    }
    if pos != original_size {
        return Err(Error::CorruptFormat(format!("entries cover {pos} of {original_size} bytes")));
    }
    Ok(delta_pos)
}
