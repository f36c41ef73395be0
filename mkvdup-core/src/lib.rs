//! Deduplicate remuxed disc content against its DVD or Blu-ray source.
//!
//! The source side is indexed by hashing fixed windows at codec sync points
//! ([`source::Indexer`]). Container packets are aligned against that index
//! ([`matcher::match_container`]) and the result is stored as an artifact
//! ([`dedup::DedupWriter`]) from which the original bytes can be read back
//! at random offsets ([`dedup::Reconstructor`]).

pub mod container;
pub mod dedup;
pub mod entry;
pub mod error;
pub mod index;
pub mod matcher;
pub mod path_safety;
pub mod progress;
pub mod rangemap;
pub mod source;
pub mod sync;

pub use error::{Error, Result};
