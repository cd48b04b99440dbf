//! Extract: decrypt and decode each entry into a plain file under the output root.

use std::fs;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::entry::{safe_join, Entry};
use crate::error::EngineError;
use crate::pipeline::Pipeline;
use crate::planner::BlockReader;
use crate::workers::{EntryTask, WorkerContext};

pub struct ExtractTask<R> {
    pipeline: Arc<Pipeline>,
    reader: R,
    blocks: BlockReader,
    out_dir: PathBuf,
    written: usize,
}

impl<R: Read + Seek + Send> ExtractTask<R> {
    pub fn new(pipeline: Arc<Pipeline>, reader: R, block_budget: u64, out_dir: &Path) -> Self {
        Self { pipeline, reader, blocks: BlockReader::new(block_budget), out_dir: out_dir.to_path_buf(), written: 0 }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::io_at(e, parent))?;
    }
    fs::write(path, bytes).map_err(|e| EngineError::io_at(e, path))
}

impl<R: Read + Seek + Send> EntryTask for ExtractTask<R> {
    /// Number of files and directories written.
    type Output = usize;

    fn begin(&mut self, _ctx: &mut WorkerContext, entries: &mut [Entry]) -> Result<(), EngineError> {
        entries.iter_mut().for_each(Entry::reset_working);
        Ok(())
    }

    fn process(&mut self, ctx: &mut WorkerContext, entries: &mut [Entry], local: usize) -> Result<(), EngineError> {
        if entries[local].is_removed() {
            return Ok(());
        }
        let Some(dest) = safe_join(&self.out_dir, &entries[local].path) else {
            ctx.recover(local, &entries[local], "path escapes the output directory");
            return Ok(());
        };

        let entry = &entries[local];
        if entry.directory {
            fs::create_dir_all(&dest).map_err(|e| EngineError::io_at(e, &dest))?;
        } else if entry.is_added() {
            let bytes = match &entry.source_path {
                Some(src) => fs::read(src).map_err(|e| EngineError::io_at(e, src))?,
                None => Vec::new(),
            };
            write_file(&dest, &bytes)?;
        } else if !entry.has_source_payload() {
            write_file(&dest, &[])?;
        } else {
            let end = entries.len();
            self.blocks.ensure(&mut self.reader, entries, local, end)?;
            let entry = &entries[local];
            match self.pipeline.decode(entry, self.blocks.payload(entry)) {
                Ok(decoded) => write_file(&dest, &decoded.bytes)?,
                Err(err) => {
                    ctx.recover(local, entry, err);
                    return Ok(());
                }
            }
        }
        self.written += 1;
        Ok(())
    }

    fn finish(self, _ctx: &mut WorkerContext, _entries: &mut [Entry]) -> Result<usize, EngineError> {
        Ok(self.written)
    }
}
