//! Compress staged files.
//!
//! Both variants encode entries marked as added and carry every other stored
//! entry through unchanged, so the pass output is a complete data region.
//!
//! - [`CompressAddedTask`] reads each staged file when it gets to it.
//! - [`CompressSmallTask`] first concatenates every staged file of its range
//!   into one scratch file, then reads that file back sequentially. Many tiny
//!   files cost one extra sequential read instead of one open per entry
//!   during the encode loop.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::codec::Method;
use crate::entry::Entry;
use crate::error::EngineError;
use crate::pipeline::Pipeline;
use crate::planner::BlockReader;
use crate::workers::spool::{OutputSpool, SpoolFile};
use crate::workers::{append_encoded, carry_through, EntryTask, WorkerContext};

const SCRATCH_BUFFER: usize = 1024 * 1024;

fn read_staged(entry: &Entry) -> Result<Vec<u8>, EngineError> {
    match &entry.source_path {
        Some(src) => fs::read(src).map_err(|e| EngineError::io_at(e, src)),
        None => Ok(Vec::new()),
    }
}

pub struct CompressAddedTask<R> {
    pipeline: Arc<Pipeline>,
    reader: R,
    blocks: BlockReader,
    spool: OutputSpool,
    method: Method,
}

impl<R: Read + Seek + Send> CompressAddedTask<R> {
    /// `spool` should be created with the configured flush threshold.
    pub fn new(pipeline: Arc<Pipeline>, reader: R, block_budget: u64, spool: OutputSpool, method: Method) -> Self {
        Self { pipeline, reader, blocks: BlockReader::new(block_budget), spool, method }
    }
}

impl<R: Read + Seek + Send> EntryTask for CompressAddedTask<R> {
    type Output = SpoolFile;

    fn begin(&mut self, _ctx: &mut WorkerContext, entries: &mut [Entry]) -> Result<(), EngineError> {
        entries.iter_mut().for_each(Entry::reset_working);
        Ok(())
    }

    fn process(&mut self, _ctx: &mut WorkerContext, entries: &mut [Entry], local: usize) -> Result<(), EngineError> {
        let entry = &mut entries[local];
        if entry.is_removed() {
            return Ok(());
        }
        if !entry.is_added() {
            return carry_through(&mut self.reader, &mut self.blocks, &mut self.spool, entries, local);
        }
        let plain = read_staged(entry)?;
        let encoded = self.pipeline.encode(&plain, self.method, entry.output_encryption())?;
        append_encoded(&mut self.spool, entry, encoded)
    }

    fn finish(self, _ctx: &mut WorkerContext, _entries: &mut [Entry]) -> Result<SpoolFile, EngineError> {
        debug!(flushes = self.spool.flushes(), bytes = self.spool.position(), "compress spool complete");
        self.spool.finish()
    }
}

pub struct CompressSmallTask<R> {
    inner: CompressAddedTask<R>,
    scratch_dir: PathBuf,
    scratch: Option<BufReader<File>>,
}

impl<R: Read + Seek + Send> CompressSmallTask<R> {
    pub fn new(inner: CompressAddedTask<R>, scratch_dir: &Path) -> Self {
        Self { inner, scratch_dir: scratch_dir.to_path_buf(), scratch: None }
    }
}

impl<R: Read + Seek + Send> EntryTask for CompressSmallTask<R> {
    type Output = SpoolFile;

    fn begin(&mut self, ctx: &mut WorkerContext, entries: &mut [Entry]) -> Result<(), EngineError> {
        self.inner.begin(ctx, entries)?;

        let file = tempfile::tempfile_in(&self.scratch_dir).map_err(|e| EngineError::io_at(e, &self.scratch_dir))?;
        let mut writer = BufWriter::with_capacity(SCRATCH_BUFFER, file);
        let mut staged = 0usize;
        for entry in entries.iter().filter(|e| e.is_added()) {
            let bytes = read_staged(entry)?;
            if bytes.len() as u64 != entry.size_decompressed {
                return Err(EngineError::Layout(format!(
                    "staged file for '{}' is {} bytes, expected {}",
                    entry.path,
                    bytes.len(),
                    entry.size_decompressed
                )));
            }
            writer.write_all(&bytes).map_err(|e| EngineError::io_at(e, &self.scratch_dir))?;
            staged += 1;
        }
        let mut file = writer.into_inner().map_err(|e| EngineError::io_at(e.into_error(), &self.scratch_dir))?;
        file.seek(SeekFrom::Start(0))?;
        debug!(worker = ctx.worker, staged, "small files concatenated");
        self.scratch = Some(BufReader::with_capacity(SCRATCH_BUFFER, file));
        Ok(())
    }

    fn process(&mut self, ctx: &mut WorkerContext, entries: &mut [Entry], local: usize) -> Result<(), EngineError> {
        if !entries[local].is_added() {
            return self.inner.process(ctx, entries, local);
        }
        let Some(scratch) = self.scratch.as_mut() else {
            return Err(EngineError::Layout("scratch file was not prepared".into()));
        };
        let entry = &mut entries[local];
        let mut plain = vec![0u8; entry.size_decompressed as usize];
        scratch.read_exact(&mut plain)?;
        let encoded = self.inner.pipeline.encode(&plain, self.inner.method, entry.output_encryption())?;
        append_encoded(&mut self.inner.spool, entry, encoded)
    }

    fn finish(self, ctx: &mut WorkerContext, entries: &mut [Entry]) -> Result<SpoolFile, EngineError> {
        self.inner.finish(ctx, entries)
    }
}
