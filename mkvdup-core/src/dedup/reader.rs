use super::format::{
    crc32, Footer, Header, Sections, FOOTER_LEN, HEADER_CHECKED_LEN, HEADER_LEN,
};
use super::ReadLimits;
use crate::entry::{check_partition, Entry, ENTRY_SIZE};
use crate::error::{Error, Result};
use crate::path_safety::{validate_path, PathPolicy};
use crate::rangemap::FileRangeMap;
use crate::source::{file_checksum, SourceData, SourceFile, SourceLayout, StreamRef};
use memmap2::Mmap;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// An opened artifact: decoded metadata plus a read-only mapping for the delta blob.
///
/// Metadata sections are checked against their footer CRCs before they are
/// decoded; the delta blob is only checked by [`DedupFile::verify_integrity`].
pub struct DedupFile {
    path: PathBuf,
    map: Mmap,
    header: Header,
    footer: Footer,
    sections: Sections,
    sources: Vec<SourceFile>,
    entries: Vec<Entry>,
    range_maps: Option<Vec<FileRangeMap>>,
}

/// Human- and JSON-facing description of an artifact.
#[derive(Clone, Debug, Serialize)]
pub struct DedupSummary {
    pub path: PathBuf,
    pub version: u32,
    pub creator: String,
    pub layout: SourceLayout,
    pub uses_es_offsets: bool,
    pub has_range_maps: bool,
    pub window_size: u32,
    pub original_size: u64,
    pub original_checksum: String,
    pub artifact_size: u64,
    pub source_files: Vec<SourceFile>,
    pub entries: u64,
    pub source_entries: u64,
    pub delta_entries: u64,
    pub lpcm_entries: u64,
    pub delta_bytes: u64,
    pub matched_bytes: u64,
    pub range_map_bytes: u64,
}

impl DedupFile {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_limits(path, &ReadLimits::default())
    }

    pub fn open_with_limits(path: &Path, limits: &ReadLimits) -> Result<Self> {
        let f = File::open(path)?;
        let len = f.metadata()?.len();
        if len < (HEADER_LEN + FOOTER_LEN) as u64 {
            return Err(Error::CorruptFormat(format!(
                "{} is too short ({len} bytes)",
                path.display()
            )));
        }
        // Artifacts are immutable once written.
        let map = unsafe { Mmap::map(&f)? };
        let header = Header::decode(&map[..HEADER_LEN])?;
        if header.entry_count > limits.max_entries {
            return Err(Error::CorruptFormat(format!(
                "{} entries exceeds limit",
                header.entry_count
            )));
        }
        if header.range_map_len > limits.max_range_map_bytes {
            return Err(Error::CorruptFormat(format!(
                "range maps of {} bytes exceed limit",
                header.range_map_len
            )));
        }
        let es = header.uses_es_offsets();
        if es != header.has_range_maps() || es != header.layout.uses_es_offsets() {
            return Err(Error::CorruptFormat("addressing flags disagree with source layout".into()));
        }
        let sections = Sections::of(&header)?;
        if sections.total_len() != len {
            return Err(Error::CorruptFormat(format!(
                "artifact is {len} bytes, header describes {}",
                sections.total_len()
            )));
        }
        let footer = Footer::decode(&map[sections.footer as usize..])?;

        let mut this = Self {
            path: path.to_path_buf(),
            map,
            header,
            footer,
            sections,
            sources: Vec::new(),
            entries: Vec::new(),
            range_maps: None,
        };
        this.check_crc("header", &this.map[..HEADER_CHECKED_LEN], this.footer.header_crc)?;
        this.check_crc("source table", this.section(sections.sources), this.footer.sources_crc)?;
        this.check_crc("entry table", this.section(sections.entries), this.footer.entries_crc)?;
        let maps = this.section(sections.range_maps);
        this.check_crc("range maps", maps, this.footer.range_maps_crc)?;

        let sources: Vec<SourceFile> = bincode::deserialize(this.section(sections.sources))
            .map_err(|e| Error::CorruptFormat(format!("source table: {e}")))?;
        if sources.len() as u64 > limits.max_sources {
            return Err(Error::CorruptFormat(format!(
                "{} source files exceeds limit",
                sources.len()
            )));
        }
        let entries = this
            .section(sections.entries)
            .chunks_exact(ENTRY_SIZE)
            .map(Entry::decode)
            .collect::<Result<Vec<_>>>()?;
        let delta_len = check_partition(&entries, this.header.original_size)?;
        if delta_len != this.header.delta_len {
            return Err(Error::CorruptFormat(format!(
                "entries reference {delta_len} delta bytes, header says {}",
                this.header.delta_len
            )));
        }
        let unknown_source =
            |e: &&Entry| e.source_file().is_some_and(|i| i as usize >= sources.len());
        if let Some(bad) = entries.iter().find(unknown_source) {
            return Err(Error::CorruptFormat(format!(
                "entry at {} names unknown source {}",
                bad.mkv_offset, bad.source
            )));
        }
        let range_maps = if this.header.has_range_maps() {
            Some(decode_range_maps(this.section(sections.range_maps), limits.max_range_map_bytes)?)
        } else {
            None
        };
        debug!(
            sources = sources.len(),
            entries = entries.len(),
            delta = delta_len,
            "artifact opened"
        );
        this.sources = sources;
        this.entries = entries;
        this.range_maps = range_maps;
        Ok(this)
    }

    fn section(&self, (off, len): (u64, u64)) -> &[u8] {
        &self.map[off as usize..(off + len) as usize]
    }

    fn check_crc(&self, what: &str, bytes: &[u8], expected: u32) -> Result<()> {
        let got = crc32(bytes);
        if got != expected {
            return Err(Error::Integrity(format!(
                "{what} checksum {got:08x}, footer has {expected:08x}"
            )));
        }
        Ok(())
    }

    /// Recompute every section checksum, the delta blob included.
    pub fn verify_integrity(&self) -> Result<()> {
        let s = self.sections;
        self.check_crc("header", &self.map[..HEADER_CHECKED_LEN], self.footer.header_crc)?;
        self.check_crc("source table", self.section(s.sources), self.footer.sources_crc)?;
        self.check_crc("entry table", self.section(s.entries), self.footer.entries_crc)?;
        self.check_crc("delta blob", self.section(s.delta), self.footer.delta_crc)?;
        self.check_crc("range maps", self.section(s.range_maps), self.footer.range_maps_crc)?;
        Ok(())
    }

    pub fn original_size(&self) -> u64 {
        self.header.original_size
    }

    pub fn original_checksum(&self) -> u64 {
        self.header.original_checksum
    }

    pub fn source_files(&self) -> &[SourceFile] {
        &self.sources
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn range_maps(&self) -> Option<&[FileRangeMap]> {
        self.range_maps.as_deref()
    }

    pub fn delta(&self) -> &[u8] {
        self.section(self.sections.delta)
    }

    pub fn summary(&self) -> DedupSummary {
        let count =
            |f: &dyn Fn(&Entry) -> bool| self.entries.iter().filter(|e| f(e)).count() as u64;
        DedupSummary {
            path: self.path.clone(),
            version: self.header.version,
            creator: self.header.creator.clone(),
            layout: self.header.layout,
            uses_es_offsets: self.header.uses_es_offsets(),
            has_range_maps: self.header.has_range_maps(),
            window_size: self.header.window_size,
            original_size: self.header.original_size,
            original_checksum: format!("{:016x}", self.header.original_checksum),
            artifact_size: self.map.len() as u64,
            source_files: self.sources.clone(),
            entries: self.entries.len() as u64,
            source_entries: count(&|e| !e.is_delta()),
            delta_entries: count(&|e| e.is_delta()),
            lpcm_entries: count(&|e| e.lpcm.is_some()),
            delta_bytes: self.header.delta_len,
            matched_bytes: self.header.original_size - self.header.delta_len,
            range_map_bytes: self.header.range_map_len,
        }
    }
}

fn decode_range_maps(bytes: &[u8], limit: u64) -> Result<Vec<FileRangeMap>> {
    let mut raw = Vec::new();
    zstd::stream::read::Decoder::new(bytes)
        .map_err(|e| Error::CorruptFormat(format!("range maps: {e}")))?
        .take(limit + 1)
        .read_to_end(&mut raw)
        .map_err(|e| Error::CorruptFormat(format!("range maps: {e}")))?;
    if raw.len() as u64 > limit {
        return Err(Error::CorruptFormat("range maps exceed decode limit".into()));
    }
    let maps: Vec<FileRangeMap> =
        bincode::deserialize(&raw).map_err(|e| Error::CorruptFormat(format!("range maps: {e}")))?;
    for m in &maps {
        for s in &m.streams {
            if s.lpcm.is_some_and(|fmt| !fmt.is_valid()) {
                return Err(Error::CorruptFormat(format!(
                    "file {} has an invalid PCM layout",
                    m.file
                )));
            }
            s.ranges.validate()?;
        }
    }
    Ok(maps)
}

/// Random-access view of the original container, rebuilt from an artifact
/// and its source files. All reads take `&self` and may run concurrently.
pub struct Reconstructor {
    file: DedupFile,
    root: PathBuf,
    data: SourceData,
}

impl Reconstructor {
    /// Check artifact integrity and map the source files under `source_root`.
    pub fn new(file: DedupFile, source_root: &Path) -> Result<Self> {
        file.verify_integrity()?;
        let data = SourceData::open(source_root, &file.sources, file.range_maps.as_deref())?;
        Ok(Self { file, root: source_root.to_path_buf(), data })
    }

    pub fn file(&self) -> &DedupFile {
        &self.file
    }

    pub fn original_size(&self) -> u64 {
        self.file.original_size()
    }

    /// Sizes are checked on open; `full` also compares content checksums.
    pub fn verify_sources(&self, full: bool) -> Result<()> {
        for sf in &self.file.sources {
            let path = validate_path(&self.root, Path::new(&sf.rel_path), PathPolicy::default())?;
            let meta = std::fs::metadata(&path)
                .map_err(|e| Error::mismatch(&path, format!("cannot stat: {e}")))?;
            if meta.len() != sf.size {
                let why = format!("size {}, expected {}", meta.len(), sf.size);
                return Err(Error::mismatch(&path, why));
            }
            if full {
                let got = file_checksum(&path)?;
                if got != sf.checksum {
                    let why = format!("checksum {got:016x}, expected {:016x}", sf.checksum);
                    return Err(Error::mismatch(&path, why));
                }
                debug!(file = %path.display(), "checksum ok");
            }
        }
        Ok(())
    }

    /// Fill `buf` from original offset `offset`; short only at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.file.original_size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - offset) as usize;
        let entries = &self.file.entries;
        let mut idx = entries.partition_point(|e| e.mkv_end() <= offset);
        let mut done = 0usize;
        while done < want {
            let e = entries.get(idx).ok_or_else(|| {
                Error::CorruptFormat(format!("no entry covers offset {}", offset + done as u64))
            })?;
            let within = offset + done as u64 - e.mkv_offset;
            let n = ((e.length - within) as usize).min(want - done);
            self.read_entry(e, within, &mut buf[done..done + n])?;
            done += n;
            idx += 1;
        }
        Ok(done)
    }

    fn read_entry(&self, e: &Entry, within: u64, out: &mut [u8]) -> Result<()> {
        let at = e.source_offset + within;
        let Some(file) = e.source_file() else {
            let delta = self.file.delta();
            let start = at as usize;
            let src = delta
                .get(start..start + out.len())
                .ok_or_else(|| Error::CorruptFormat(format!("delta read at {at} past blob end")))?;
            out.copy_from_slice(src);
            return Ok(());
        };
        let stream = StreamRef { file, is_video: e.is_video, substream: e.substream };
        let got = match &self.data {
            SourceData::Es(es) => es.read_with_format(stream, at, out, e.lpcm)?,
            SourceData::Raw(raw) => {
                let src = raw.slice(file, at, out.len()).unwrap_or(&[]);
                out[..src.len()].copy_from_slice(src);
                src.len()
            }
        };
        if got != out.len() {
            let path = self
                .data
                .files()
                .get(file as usize)
                .map(|m| m.path().to_path_buf())
                .unwrap_or_default();
            let why = format!("short read at {at}: {got} of {} bytes", out.len());
            return Err(Error::mismatch(path, why));
        }
        Ok(())
    }

    /// Write the whole original to `w`, failing if its xxh64 differs from the recorded one.
    pub fn write_to(&self, w: &mut dyn Write) -> Result<u64> {
        let size = self.file.original_size();
        let mut buf = vec![0u8; 1 << 20];
        let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);
        let mut pos = 0u64;
        while pos < size {
            let n = self.read_at(&mut buf, pos)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            w.write_all(&buf[..n])?;
            pos += n as u64;
        }
        w.flush()?;
        let got = hasher.digest();
        if pos != size || got != self.file.original_checksum() {
            return Err(Error::Integrity(format!(
                "reconstructed {pos} bytes with checksum {got:016x}, \
                 expected {size} bytes with {:016x}",
                self.file.original_checksum()
            )));
        }
        info!(bytes = pos, "reconstruction verified");
        Ok(pos)
    }
}
