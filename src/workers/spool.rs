//! Per-worker temporary output.
//!
//! Each worker appends its encoded payloads to a private file named
//! `{token}_{start}.tmp` inside the pass directory. Writes are batched in
//! memory and hit the file once the batch reaches the flush threshold.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Deterministic spool file name for the worker starting at `start`.
pub fn spool_name(token: &str, start: usize) -> String {
    format!("{token}_{start}.tmp")
}

/// A finished spool, ready to be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolFile {
    pub path: PathBuf,
    pub len: u64,
}

#[derive(Debug)]
pub struct OutputSpool {
    path: PathBuf,
    file: File,
    pending: Vec<u8>,
    flush_threshold: usize,
    /// Logical length: bytes written plus bytes pending.
    position: u64,
    flushes: u64,
}

impl OutputSpool {
    pub fn create(dir: &Path, token: &str, start: usize, flush_threshold: usize) -> Result<Self, EngineError> {
        let path = dir.join(spool_name(token, start));
        let file = File::create(&path).map_err(|e| EngineError::io_at(e, &path))?;
        Ok(Self {
            path,
            file,
            pending: Vec::with_capacity(flush_threshold.min(16 * 1024 * 1024)),
            flush_threshold: flush_threshold.max(1),
            position: 0,
            flushes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of physical writes so far.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Appends `bytes` and returns the offset they start at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, EngineError> {
        let offset = self.position;
        if self.pending.is_empty() && bytes.len() >= self.flush_threshold {
            self.write(bytes)?;
        } else {
            self.pending.extend_from_slice(bytes);
            if self.pending.len() >= self.flush_threshold {
                self.flush()?;
            }
        }
        self.position += bytes.len() as u64;
        Ok(offset)
    }

    pub fn flush(&mut self) -> Result<(), EngineError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        self.write(&pending)?;
        self.pending = pending;
        self.pending.clear();
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.file.write_all(bytes).map_err(|e| EngineError::io_at(e, &self.path))?;
        self.flushes += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<SpoolFile, EngineError> {
        self.flush()?;
        self.file.flush().map_err(|e| EngineError::io_at(e, &self.path))?;
        Ok(SpoolFile { path: self.path, len: self.position })
    }
}
