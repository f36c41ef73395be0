use std::io::{self, Read, Seek, SeekFrom, Write};
use tempfile::SpooledTempFile;

/// Append-only store for unmatched container bytes. Stays in memory up to
/// `max_mem` bytes, then rolls over to an anonymous temporary file.
pub struct DeltaSpool {
    file: SpooledTempFile,
    len: u64,
}

impl DeltaSpool {
    pub fn new(max_mem: usize) -> Self {
        Self { file: tempfile::spooled_tempfile(max_mem), len: 0 }
    }

    /// Append `bytes`; returns the blob offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let at = self.len;
        self.file.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(at)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_on_disk(&self) -> bool {
        self.file.is_rolled()
    }

    /// Stream the whole blob into `w`.
    pub fn copy_to(&mut self, w: &mut dyn Write) -> io::Result<u64> {
        self.file.seek(SeekFrom::Start(0))?;
        let n = io::copy(&mut (&mut self.file).take(self.len), w)?;
        self.file.seek(SeekFrom::End(0))?;
        if n != self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "delta spool shorter than recorded",
            ));
        }
        Ok(n)
    }

    pub fn to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len as usize);
        self.copy_to(&mut out)?;
        Ok(out)
    }
}
