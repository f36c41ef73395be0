//! Error types shared by the indexer, matcher and dedup codec.

use std::path::PathBuf;

/// All failures surfaced by `mkvdup_core`.
///
/// A hash hit that fails byte verification is not represented here: the
/// matcher discards it and the bytes fall through to the delta.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Source directory unreadable, unclassifiable or without indexable content
    #[error("index build failed: {0}")]
    IndexBuild(String),
    /// A footer checksum does not match the section it covers
    #[error("integrity check failed: {0}")]
    Integrity(String),
    /// A source file is missing or differs from the artifact's source table
    #[error("source mismatch for {path:?}: {reason}")]
    SourceMismatch { path: PathBuf, reason: String },
    /// Bad magic, unsupported version, truncated or undecodable section
    #[error("corrupt dedup artifact: {0}")]
    CorruptFormat(String),
    /// A relative path from an artifact tries to leave its source root
    #[error("unsafe path: {0}")]
    UnsafePath(String),
    /// Caller-supplied data violates a documented precondition
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn mismatch(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::SourceMismatch { path: path.into(), reason: reason.into() }
    }
}
