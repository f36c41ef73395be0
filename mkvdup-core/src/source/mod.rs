//! Source indexer: classifies a disc source directory and builds the
//! hash index (plus range maps for transport-stream sources).

mod raw;
mod reader;
mod scanner;
mod ts;

pub use reader::{EsSource, MappedFile, RawSource, SourceData, SourceRead, StreamRef};

use crate::error::{Error, Result};
use crate::index::{HashIndex, DEFAULT_WINDOW_SIZE};
use crate::rangemap::FileRangeMap;
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Physical layout of a disc source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceLayout {
    /// Program-stream VOB files or an ISO image, indexed as opaque blobs
    Dvd,
    /// Transport-stream m2ts files, indexed per elementary stream
    Bluray,
}

impl SourceLayout {
    pub fn tag(self) -> u32 {
        match self {
            SourceLayout::Dvd => 1,
            SourceLayout::Bluray => 2,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(SourceLayout::Dvd),
            2 => Some(SourceLayout::Bluray),
            _ => None,
        }
    }

    pub fn uses_es_offsets(self) -> bool {
        matches!(self, SourceLayout::Bluray)
    }
}

/// One physical file under the source root.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    /// Relative to the source root, `/`-separated
    pub rel_path: String,
    pub size: u64,
    /// xxh64 of the whole file
    pub checksum: u64,
}

pub struct IndexerConfig {
    pub window_size: usize,
    pub read_chunk: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self { window_size: DEFAULT_WINDOW_SIZE, read_chunk: 4 << 20 }
    }
}

/// Everything a matching or reconstruction run needs from the source side.
pub struct SourceIndex {
    pub root: PathBuf,
    pub layout: SourceLayout,
    pub files: Vec<SourceFile>,
    pub index: HashIndex,
    /// Present exactly when the layout uses elementary-stream offsets
    pub range_maps: Option<Vec<FileRangeMap>>,
}

impl SourceIndex {
    pub fn uses_es_offsets(&self) -> bool {
        self.index.uses_es_offsets()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Map the indexed files for byte verification.
    pub fn open_data(&self) -> Result<SourceData> {
        SourceData::open(&self.root, &self.files, self.range_maps.as_deref())
    }
}

/// Result of inspecting a source directory.
#[derive(Clone, Debug)]
pub struct Classification {
    pub layout: SourceLayout,
    /// Files to index, sorted by relative path
    pub files: Vec<PathBuf>,
}

fn ci_glob(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::InvalidInput(format!("glob {pattern}: {e}")))
}

/// Decide between the Blu-ray and DVD layouts and list the files to index.
pub fn classify(root: &Path) -> Result<Classification> {
    let m2ts = ci_glob("**/BDMV/STREAM/*.m2ts")?;
    let vob = ci_glob("**/VIDEO_TS/*.vob")?;
    let iso = ci_glob("**/*.iso")?;

    let meta = std::fs::metadata(root)
        .map_err(|e| Error::IndexBuild(format!("cannot read {}: {e}", root.display())))?;
    let (mut bd, mut dvd, mut isos) = (Vec::new(), Vec::new(), Vec::new());
    if meta.is_file() {
        // A bare image passed directly as the source.
        if iso.is_match(root.file_name().map(Path::new).unwrap_or(root)) {
            isos.push(root.to_path_buf());
        }
    } else {
        for ent in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let ent = ent.map_err(|e| Error::IndexBuild(format!("walk {}: {e}", root.display())))?;
            if !ent.file_type().is_file() {
                continue;
            }
            let rel = rel_path(root, ent.path());
            if m2ts.is_match(&rel) {
                bd.push(ent.path().to_path_buf());
            } else if vob.is_match(&rel) {
                dvd.push(ent.path().to_path_buf());
            } else if iso.is_match(&rel) {
                isos.push(ent.path().to_path_buf());
            }
        }
    }

    let (layout, mut files) = if !bd.is_empty() {
        (SourceLayout::Bluray, bd)
    } else if !dvd.is_empty() {
        (SourceLayout::Dvd, dvd)
    } else if !isos.is_empty() {
        (SourceLayout::Dvd, isos)
    } else {
        return Err(Error::IndexBuild(format!(
            "no BDMV/STREAM, VIDEO_TS or ISO content under {}",
            root.display()
        )));
    };
    files.sort_by_key(|p| rel_path(root, p));
    info!(layout = ?layout, files = files.len(), "classified source");
    Ok(Classification { layout, files })
}

/// Root-relative, `/`-separated path used in the source table.
pub(crate) fn rel_path(root: &Path, path: &Path) -> String {
    if root == path {
        return path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
    }
    let rel = pathdiff::diff_paths(path, root).unwrap_or_else(|| path.to_path_buf());
    rel.to_string_lossy().replace('\\', "/")
}

/// The directory that relative paths in the source table hang off.
pub fn source_root(root: &Path) -> PathBuf {
    if root.is_file() {
        root.parent().map(Path::to_path_buf).unwrap_or_default()
    } else {
        root.to_path_buf()
    }
}

pub struct Indexer;

impl Indexer {
    /// Classify `root` and index every file of its layout.
    ///
    /// `progress` receives `(bytes processed, total bytes)` after each read.
    /// No partial index is ever returned.
    pub fn build(
        root: &Path,
        cfg: &IndexerConfig,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<SourceIndex> {
        if cfg.window_size == 0 || cfg.read_chunk < cfg.window_size {
            return Err(Error::InvalidInput(
                "window size must be non-zero and below read chunk".into(),
            ));
        }
        let class = classify(root)?;
        let base = source_root(root);
        let total: u64 = class
            .files
            .iter()
            .map(|p| std::fs::metadata(p).map(|m| m.len()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| Error::IndexBuild(format!("stat: {e}")))?
            .iter()
            .sum();

        let es = class.layout.uses_es_offsets();
        let mut index = HashIndex::new(es, cfg.window_size);
        let mut files = Vec::with_capacity(class.files.len());
        let mut maps = Vec::new();
        let mut done = 0u64;
        for (fi, path) in class.files.iter().enumerate() {
            let file_idx = u32::try_from(fi)
                .map_err(|_| Error::IndexBuild("too many source files".into()))?;
            let before = index.location_count();
            let mut tick = |n: u64| {
                done += n;
                progress(done, total);
            };
            let (size, checksum) = if es {
                let (size, checksum, map) =
                    ts::index_ts_file(file_idx, path, cfg, &mut index, &mut tick)?;
                maps.push(map);
                (size, checksum)
            } else {
                raw::index_raw_file(file_idx, path, cfg, &mut index, &mut tick)?
            };
            let locations = index.location_count() - before;
            debug!(file = %path.display(), size, locations, "indexed");
            files.push(SourceFile { rel_path: rel_path(&base, path), size, checksum });
        }

        index.finish();
        if index.is_empty() {
            return Err(Error::IndexBuild(format!("no indexable content under {}", root.display())));
        }
        info!(
            hashes = index.len(),
            locations = index.location_count(),
            files = files.len(),
            "source index built"
        );
        Ok(SourceIndex {
            root: base,
            layout: class.layout,
            files,
            index,
            range_maps: es.then_some(maps),
        })
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
pub(crate) fn read_fill(f: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match f.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// xxh64 of a whole file, streamed.
pub fn file_checksum(path: &Path) -> Result<u64> {
    let mut f = File::open(path)?;
    let mut h = xxhash_rust::xxh64::Xxh64::new(0);
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = read_fill(&mut f, &mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(h.digest())
}
