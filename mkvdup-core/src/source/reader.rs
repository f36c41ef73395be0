//! Read access to indexed source bytes, in raw or elementary-stream addressing.

use super::SourceFile;
use crate::error::{Error, Result};
use crate::index::Location;
use crate::path_safety::{validate_path, PathPolicy};
use crate::rangemap::{FileRangeMap, LpcmFormat, StreamMap};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Addresses one logical byte space of a source file: the whole file in raw
/// mode, or one elementary stream of it in ES mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamRef {
    pub file: u32,
    pub is_video: bool,
    pub substream: u8,
}

impl From<&Location> for StreamRef {
    fn from(loc: &Location) -> Self {
        StreamRef { file: loc.file, is_video: loc.is_video, substream: loc.substream }
    }
}

/// Common read interface over both source addressing schemes.
pub trait SourceRead {
    /// Length of the addressable space behind `stream`.
    fn stream_len(&self, stream: StreamRef) -> Result<u64>;

    /// Copy bytes starting at `offset` into `buf`; short only at end of stream.
    fn read_at(&self, stream: StreamRef, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// A read-only mapping of one source file, owned for the life of a run.
pub struct MappedFile {
    path: PathBuf,
    mmap: Option<Mmap>,
}

impl MappedFile {
    /// Open `rel` under `root` and check it still has the recorded size.
    pub fn open(root: &Path, entry: &SourceFile) -> Result<Self> {
        let path = validate_path(root, Path::new(&entry.rel_path), PathPolicy::default())?;
        let f = File::open(&path).map_err(|e| Error::mismatch(&path, format!("cannot open: {e}")))?;
        let len = f.metadata()?.len();
        if len != entry.size {
            return Err(Error::mismatch(&path, format!("size {len}, expected {}", entry.size)));
        }
        // Zero-length files cannot be mapped on every platform.
        let mmap = if len == 0 {
            None
        } else {
            // Source media are treated as immutable while mapped.
            Some(unsafe { Mmap::map(&f)? })
        };
        Ok(Self { path, mmap })
    }

    pub fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn range(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let bytes = self.bytes();
        let start = usize::try_from(offset).ok();
        let end = offset.checked_add(len).and_then(|e| usize::try_from(e).ok());
        match (start, end) {
            (Some(s), Some(e)) if e <= bytes.len() => Ok(&bytes[s..e]),
            _ => Err(Error::CorruptFormat(format!(
                "range {offset}+{len} outside {} ({} bytes)",
                self.path.display(),
                bytes.len()
            ))),
        }
    }
}

/// Files addressed by raw byte offset.
pub struct RawSource {
    files: Vec<MappedFile>,
}

impl RawSource {
    /// Zero-copy view of `len` bytes at `offset`, clipped to the file end.
    pub fn slice(&self, file: u32, offset: u64, len: usize) -> Option<&[u8]> {
        let bytes = self.files.get(file as usize)?.bytes();
        let start = usize::try_from(offset).ok()?;
        if start > bytes.len() {
            return None;
        }
        let end = start.saturating_add(len).min(bytes.len());
        Some(&bytes[start..end])
    }
}

impl SourceRead for RawSource {
    fn stream_len(&self, stream: StreamRef) -> Result<u64> {
        self.files
            .get(stream.file as usize)
            .map(|f| f.bytes().len() as u64)
            .ok_or_else(|| Error::CorruptFormat(format!("no source file {}", stream.file)))
    }

    fn read_at(&self, stream: StreamRef, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let src = self.slice(stream.file, offset, buf.len()).ok_or_else(|| {
            Error::CorruptFormat(format!("offset {offset} past source {}", stream.file))
        })?;
        buf[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }
}

/// Files addressed by elementary-stream offset, translated through range maps.
pub struct EsSource {
    files: Vec<MappedFile>,
    maps: Vec<FileRangeMap>,
}

impl EsSource {
    fn stream(&self, stream: StreamRef) -> Result<&StreamMap> {
        self.maps
            .iter()
            .find(|m| m.file == stream.file)
            .and_then(|m| m.stream(stream.is_video, stream.substream))
            .ok_or_else(|| {
                Error::CorruptFormat(format!(
                    "no range map for file {} video={} substream={}",
                    stream.file, stream.is_video, stream.substream
                ))
            })
    }

    fn copy_raw(&self, file: u32, map: &StreamMap, es: u64, out: &mut [u8]) -> Result<()> {
        let spans = map.ranges.translate(es, out.len() as u64).ok_or_else(|| {
            Error::CorruptFormat(format!("ES range {es}+{} outside stream", out.len()))
        })?;
        let mapped = self
            .files
            .get(file as usize)
            .ok_or_else(|| Error::CorruptFormat(format!("no source file {file}")))?;
        let mut at = 0usize;
        for (raw, n) in spans {
            let src = mapped.range(raw, n)?;
            out[at..at + src.len()].copy_from_slice(src);
            at += src.len();
        }
        Ok(())
    }
}

impl EsSource {
    /// Read indexed-form ES bytes. With `lpcm`, offsets address the
    /// normalized sample stream and stored frames are converted on the fly.
    pub fn read_with_format(
        &self,
        stream: StreamRef,
        offset: u64,
        buf: &mut [u8],
        lpcm: Option<LpcmFormat>,
    ) -> Result<usize> {
        let map = self.stream(stream)?;
        let stored_len = map.ranges.es_len();
        let Some(fmt) = lpcm else {
            if offset >= stored_len {
                return Ok(0);
            }
            let n = (buf.len() as u64).min(stored_len - offset) as usize;
            self.copy_raw(stream.file, map, offset, &mut buf[..n])?;
            return Ok(n);
        };
        if !fmt.is_valid() {
            return Err(Error::CorruptFormat(format!("invalid PCM layout {fmt:?}")));
        }
        let es_len = fmt.indexed_len(stored_len);
        if offset >= es_len {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(es_len - offset) as usize;
        // Widen to whole frames so samples swap and padding drops cleanly.
        let (uf, pf) = (fmt.frame_bytes() as u64, fmt.stored_frame_bytes() as u64);
        let first = offset / uf;
        let last = (offset + n as u64).div_ceil(uf);
        let stored_start = first * pf;
        let stored_end = (last * pf).min(stored_len);
        let mut stored = vec![0u8; (stored_end - stored_start) as usize];
        self.copy_raw(stream.file, map, stored_start, &mut stored)?;
        let mut tmp = Vec::with_capacity(stored.len());
        fmt.normalize(&stored, &mut tmp);
        let skip = (offset - first * uf) as usize;
        buf[..n].copy_from_slice(&tmp[skip..skip + n]);
        Ok(n)
    }
}

impl SourceRead for EsSource {
    fn stream_len(&self, stream: StreamRef) -> Result<u64> {
        let map = self.stream(stream)?;
        let stored = map.ranges.es_len();
        Ok(map.lpcm.map_or(stored, |fmt| fmt.indexed_len(stored)))
    }

    fn read_at(&self, stream: StreamRef, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let lpcm = self.stream(stream)?.lpcm;
        self.read_with_format(stream, offset, buf, lpcm)
    }
}

/// The two source addressing strategies behind one read interface.
pub enum SourceData {
    Raw(RawSource),
    Es(EsSource),
}

impl SourceData {
    /// Map every file of `files` under `root`; ES addressing when range maps are given.
    pub fn open(
        root: &Path,
        files: &[SourceFile],
        range_maps: Option<&[FileRangeMap]>,
    ) -> Result<Self> {
        let mapped = files
            .iter()
            .map(|f| MappedFile::open(root, f))
            .collect::<Result<Vec<_>>>()?;
        Ok(match range_maps {
            Some(maps) => SourceData::Es(EsSource { files: mapped, maps: maps.to_vec() }),
            None => SourceData::Raw(RawSource { files: mapped }),
        })
    }

    /// Zero-copy access, available for raw addressing only.
    pub fn slice(&self, stream: StreamRef, offset: u64, len: usize) -> Option<&[u8]> {
        match self {
            SourceData::Raw(r) => r.slice(stream.file, offset, len),
            SourceData::Es(_) => None,
        }
    }

    pub fn is_es(&self) -> bool {
        matches!(self, SourceData::Es(_))
    }

    pub fn files(&self) -> &[MappedFile] {
        match self {
            SourceData::Raw(r) => &r.files,
            SourceData::Es(e) => &e.files,
        }
    }

    /// LPCM layout of the stream behind `stream`, if it is byte-swapped PCM.
    pub fn lpcm(&self, stream: StreamRef) -> Option<LpcmFormat> {
        match self {
            SourceData::Raw(_) => None,
            SourceData::Es(e) => e.stream(stream).ok().and_then(|m| m.lpcm),
        }
    }
}

impl SourceRead for SourceData {
    fn stream_len(&self, stream: StreamRef) -> Result<u64> {
        match self {
            SourceData::Raw(r) => r.stream_len(stream),
            SourceData::Es(e) => e.stream_len(stream),
        }
    }

    fn read_at(&self, stream: StreamRef, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            SourceData::Raw(r) => r.read_at(stream, offset, buf),
            SourceData::Es(e) => e.read_at(stream, offset, buf),
        }
    }
}
