//! Fixed-size header and footer of the dedup artifact.
//!
//! ```text
//! [header 128][source table][entry table][delta blob][range maps][footer 32]
//! ```
//!
//! The source table is bincode, the entry table is fixed 32-byte records,
//! the range-map section is zstd(bincode). All integers are little endian.

use crate::error::{Error, Result};
use crate::source::SourceLayout;

pub const MAGIC: &[u8; 8] = b"MKVDEDUP";
pub const FOOTER_MAGIC: &[u8; 8] = b"MKVDFOOT";
pub const VERSION: u32 = 1;

pub const HEADER_LEN: usize = 128;
/// Header bytes covered by the header checksum; the creator string follows.
pub const HEADER_CHECKED_LEN: usize = 72;
pub const CREATOR_LEN: usize = HEADER_LEN - HEADER_CHECKED_LEN;
pub const FOOTER_LEN: usize = 32;

pub const FLAG_ES_OFFSETS: u32 = 0x1;
pub const FLAG_RANGE_MAPS: u32 = 0x2;
const KNOWN_FLAGS: u32 = FLAG_ES_OFFSETS | FLAG_RANGE_MAPS;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub flags: u32,
    pub layout: SourceLayout,
    pub window_size: u32,
    pub original_size: u64,
    pub original_checksum: u64,
    pub source_table_len: u64,
    pub entry_count: u64,
    pub delta_len: u64,
    pub range_map_len: u64,
    pub creator: String,
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[at..at + 4]);
    u32::from_le_bytes(a)
}

fn le_u64(b: &[u8], at: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(a)
}

impl Header {
    pub fn uses_es_offsets(&self) -> bool {
        self.flags & FLAG_ES_OFFSETS != 0
    }

    pub fn has_range_maps(&self) -> bool {
        self.flags & FLAG_RANGE_MAPS != 0
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[0..8].copy_from_slice(MAGIC);
        h[8..12].copy_from_slice(&self.version.to_le_bytes());
        h[12..16].copy_from_slice(&self.flags.to_le_bytes());
        h[16..20].copy_from_slice(&self.layout.tag().to_le_bytes());
        h[20..24].copy_from_slice(&self.window_size.to_le_bytes());
        h[24..32].copy_from_slice(&self.original_size.to_le_bytes());
        h[32..40].copy_from_slice(&self.original_checksum.to_le_bytes());
        h[40..48].copy_from_slice(&self.source_table_len.to_le_bytes());
        h[48..56].copy_from_slice(&self.entry_count.to_le_bytes());
        h[56..64].copy_from_slice(&self.delta_len.to_le_bytes());
        h[64..72].copy_from_slice(&self.range_map_len.to_le_bytes());
        let creator = truncate_utf8(&self.creator, CREATOR_LEN);
        let end = HEADER_CHECKED_LEN + creator.len();
        h[HEADER_CHECKED_LEN..end].copy_from_slice(creator.as_bytes());
        h
    }

    pub fn decode(h: &[u8]) -> Result<Self> {
        if h.len() < HEADER_LEN {
            return Err(Error::CorruptFormat("truncated header".into()));
        }
        if &h[0..8] != MAGIC {
            return Err(Error::CorruptFormat("bad magic".into()));
        }
        let version = le_u32(h, 8);
        if version != VERSION {
            return Err(Error::CorruptFormat(format!("unsupported format version {version}")));
        }
        let flags = le_u32(h, 12);
        if flags & !KNOWN_FLAGS != 0 {
            return Err(Error::CorruptFormat(format!("unknown header flags {flags:#x}")));
        }
        let tag = le_u32(h, 16);
        let layout = SourceLayout::from_tag(tag)
            .ok_or_else(|| Error::CorruptFormat(format!("unknown source layout {tag}")))?;
        let raw_creator = &h[HEADER_CHECKED_LEN..HEADER_LEN];
        let end = raw_creator.iter().position(|&b| b == 0).unwrap_or(CREATOR_LEN);
        Ok(Self {
            version,
            flags,
            layout,
            window_size: le_u32(h, 20),
            original_size: le_u64(h, 24),
            original_checksum: le_u64(h, 32),
            source_table_len: le_u64(h, 40),
            entry_count: le_u64(h, 48),
            delta_len: le_u64(h, 56),
            range_map_len: le_u64(h, 64),
            creator: String::from_utf8_lossy(&raw_creator[..end]).into_owned(),
        })
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// CRC32 of every section, written last.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Footer {
    pub header_crc: u32,
    pub sources_crc: u32,
    pub entries_crc: u32,
    pub delta_crc: u32,
    pub range_maps_crc: u32,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut f = [0u8; FOOTER_LEN];
        f[0..8].copy_from_slice(FOOTER_MAGIC);
        f[8..12].copy_from_slice(&self.header_crc.to_le_bytes());
        f[12..16].copy_from_slice(&self.sources_crc.to_le_bytes());
        f[16..20].copy_from_slice(&self.entries_crc.to_le_bytes());
        f[20..24].copy_from_slice(&self.delta_crc.to_le_bytes());
        f[24..28].copy_from_slice(&self.range_maps_crc.to_le_bytes());
        f
    }

    pub fn decode(f: &[u8]) -> Result<Self> {
        if f.len() < FOOTER_LEN || &f[0..8] != FOOTER_MAGIC {
            return Err(Error::CorruptFormat("bad footer".into()));
        }
        Ok(Self {
            header_crc: le_u32(f, 8),
            sources_crc: le_u32(f, 12),
            entries_crc: le_u32(f, 16),
            delta_crc: le_u32(f, 20),
            range_maps_crc: le_u32(f, 24),
        })
    }
}

/// Byte offsets of each section, derived from the header.
#[derive(Clone, Copy, Debug)]
pub struct Sections {
    pub sources: (u64, u64),
    pub entries: (u64, u64),
    pub delta: (u64, u64),
    pub range_maps: (u64, u64),
    pub footer: u64,
}

impl Sections {
    pub fn of(h: &Header) -> Result<Self> {
        let overflow = || Error::CorruptFormat("section lengths overflow".into());
        let entries_len = h
            .entry_count
            .checked_mul(crate::entry::ENTRY_SIZE as u64)
            .ok_or_else(overflow)?;
        let s0 = HEADER_LEN as u64;
        let e0 = s0.checked_add(h.source_table_len).ok_or_else(overflow)?;
        let d0 = e0.checked_add(entries_len).ok_or_else(overflow)?;
        let r0 = d0.checked_add(h.delta_len).ok_or_else(overflow)?;
        let f0 = r0.checked_add(h.range_map_len).ok_or_else(overflow)?;
        f0.checked_add(FOOTER_LEN as u64).ok_or_else(overflow)?;
        Ok(Self {
            sources: (s0, h.source_table_len),
            entries: (e0, entries_len),
            delta: (d0, h.delta_len),
            range_maps: (r0, h.range_map_len),
            footer: f0,
        })
    }

    pub fn total_len(&self) -> u64 {
        self.footer + FOOTER_LEN as u64
    }
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(bytes);
    h.finalize()
}
