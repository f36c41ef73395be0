use super::format::{
    crc32, Footer, Header, Sections, FLAG_ES_OFFSETS, FLAG_RANGE_MAPS, HEADER_CHECKED_LEN, VERSION,
};
use super::DEFAULT_CREATOR;
use crate::entry::{check_partition, ENTRY_SIZE};
use crate::error::{Error, Result};
use crate::matcher::MatchResult;
use crate::source::SourceIndex;
use crc32fast::Hasher as Crc32;
use fs2::FileExt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// zstd level used for the range-map section.
const RANGE_MAP_ZSTD_LEVEL: i32 = 3;

/// Passes writes through while hashing them.
struct CrcWriter<'a, W: Write> {
    inner: &'a mut W,
    crc: Crc32,
}

impl<W: Write> Write for CrcWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Clone, Debug)]
pub struct WriteSummary {
    pub artifact_size: u64,
    pub entries: u64,
    pub delta_len: u64,
    pub range_map_len: u64,
}

/// Serializes a match result into a dedup artifact.
pub struct DedupWriter {
    creator: String,
}

impl Default for DedupWriter {
    fn default() -> Self {
        Self { creator: DEFAULT_CREATOR.to_string() }
    }
}

impl DedupWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    pub fn write(
        &self,
        path: &Path,
        source: &SourceIndex,
        result: &mut MatchResult,
    ) -> Result<WriteSummary> {
        let delta_len = check_partition(&result.entries, result.original_size)
            .map_err(|e| Error::InvalidInput(format!("entry list: {e}")))?;
        if delta_len != result.delta.len() {
            return Err(Error::InvalidInput(format!(
                "entries reference {delta_len} delta bytes, spool holds {}",
                result.delta.len()
            )));
        }

        // Range maps are encoded up front so the artifact size is known.
        let range_maps = match &source.range_maps {
            Some(maps) => {
                let raw = bincode::serialize(maps)
                    .map_err(|e| Error::InvalidInput(format!("range maps: {e}")))?;
                zstd::stream::encode_all(&raw[..], RANGE_MAP_ZSTD_LEVEL)?
            }
            None => Vec::new(),
        };
        let sources = bincode::serialize(&source.files)
            .map_err(|e| Error::InvalidInput(format!("source table: {e}")))?;
        let mut entries = Vec::with_capacity(result.entries.len() * ENTRY_SIZE);
        for e in &result.entries {
            entries.extend_from_slice(&e.encode());
        }

        let mut flags = 0;
        if source.uses_es_offsets() {
            flags |= FLAG_ES_OFFSETS;
        }
        if source.range_maps.is_some() {
            flags |= FLAG_RANGE_MAPS;
        }
        let header = Header {
            version: VERSION,
            flags,
            layout: source.layout,
            window_size: source.index.window_size() as u32,
            original_size: result.original_size,
            original_checksum: result.original_checksum,
            source_table_len: sources.len() as u64,
            entry_count: result.entries.len() as u64,
            delta_len,
            range_map_len: range_maps.len() as u64,
            creator: self.creator.clone(),
        };
        let head = header.encode();
        let total = Sections::of(&header)?.total_len();

        let f = File::create(path)?;
        if let Err(e) = f.allocate(total) {
            debug!(error = %e, "preallocation unavailable");
        }
        let mut w = BufWriter::with_capacity(1 << 20, &f);
        w.write_all(&head)?;
        w.write_all(&sources)?;
        w.write_all(&entries)?;
        let mut cw = CrcWriter { inner: &mut w, crc: Crc32::new() };
        let copied = result.delta.copy_to(&mut cw)?;
        let delta_crc = cw.crc.finalize();
        debug!(bytes = copied, "delta blob written");
        w.write_all(&range_maps)?;
        let footer = Footer {
            header_crc: crc32(&head[..HEADER_CHECKED_LEN]),
            sources_crc: crc32(&sources),
            entries_crc: crc32(&entries),
            delta_crc,
            range_maps_crc: crc32(&range_maps),
        };
        w.write_all(&footer.encode())?;
        w.flush()?;
        drop(w);
        f.set_len(total)?;
        f.sync_all()?;

        info!(
            path = %path.display(),
            size = total,
            entries = result.entries.len(),
            delta = delta_len,
            "artifact written"
        );
        Ok(WriteSummary {
            artifact_size: total,
            entries: result.entries.len() as u64,
            delta_len,
            range_map_len: range_maps.len() as u64,
        })
    }
}
