//! Repack / defragment: rewrite every entry into the worker's spool.
//!
//! Per entry, one of four paths:
//! - removed entries are skipped;
//! - added entries are read from disk and encoded;
//! - entries to recompress go through decode → encode, and entries to
//!   re-encrypt have their encryption swapped. If decoding fails, the stored
//!   bytes are kept as they are;
//! - everything else is copied, trimmed of stale padding when defragmenting.

use std::fs;
use std::io::{Read, Seek};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::Method;
use crate::entry::{align_up, Entry, Modification, ALIGNMENT};
use crate::error::EngineError;
use crate::pipeline::{Encoded, Pipeline};
use crate::planner::BlockReader;
use crate::workers::spool::{OutputSpool, SpoolFile};
use crate::workers::{append_encoded, carry_through, EntryTask, WorkerContext};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepackOptions {
    /// Re-encode every stored entry with this method.
    pub recompress: Option<Method>,
    /// Drop stale padding past the aligned compressed size.
    pub defragment: bool,
}

pub struct RepackTask<R> {
    pipeline: Arc<Pipeline>,
    reader: R,
    blocks: BlockReader,
    spool: OutputSpool,
    options: RepackOptions,
}

impl<R: Read + Seek + Send> RepackTask<R> {
    pub fn new(pipeline: Arc<Pipeline>, reader: R, block_budget: u64, spool: OutputSpool, options: RepackOptions) -> Self {
        Self { pipeline, reader, blocks: BlockReader::new(block_budget), spool, options }
    }

    fn wants_reencrypt(entry: &Entry) -> bool {
        entry.modification == Modification::Reencrypt
            || entry.target_encryption.is_some_and(|target| target != entry.encryption)
    }

    fn add(&mut self, entry: &mut Entry) -> Result<(), EngineError> {
        let plain = match &entry.source_path {
            Some(src) => fs::read(src).map_err(|e| EngineError::io_at(e, src))?,
            None => Vec::new(),
        };
        let method = self.options.recompress.unwrap_or_default();
        let encoded = self.pipeline.encode(&plain, method, entry.output_encryption())?;
        append_encoded(&mut self.spool, entry, encoded)
    }
}

impl<R: Read + Seek + Send> EntryTask for RepackTask<R> {
    type Output = SpoolFile;

    fn begin(&mut self, _ctx: &mut WorkerContext, entries: &mut [Entry]) -> Result<(), EngineError> {
        let transform = self.options.recompress.is_some();
        for entry in entries.iter_mut() {
            entry.reset_working();
            let passthrough = !transform && !Self::wants_reencrypt(entry) && !entry.encryption.is_encrypted();
            if self.options.defragment && passthrough && entry.has_source_payload() {
                entry.temporary_size_compressed_alignment = align_up(entry.size_compressed, ALIGNMENT);
            }
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut WorkerContext, entries: &mut [Entry], local: usize) -> Result<(), EngineError> {
        if entries[local].is_removed() {
            return Ok(());
        }
        if entries[local].is_added() {
            return self.add(&mut entries[local]);
        }

        let reencrypt = Self::wants_reencrypt(&entries[local]);
        let recompress = self.options.recompress;
        if !entries[local].has_source_payload() || (recompress.is_none() && !reencrypt) {
            return carry_through(&mut self.reader, &mut self.blocks, &mut self.spool, entries, local);
        }

        let end = entries.len();
        self.blocks.ensure(&mut self.reader, entries, local, end)?;
        let entry = &entries[local];
        let payload = self.blocks.payload(entry);

        let rewritten = match recompress {
            Some(method) => match self.pipeline.decode(entry, payload) {
                Ok(decoded) => Some(self.pipeline.encode(&decoded.bytes, method, entry.output_encryption())?),
                Err(err) => {
                    ctx.recover(local, entry, format!("kept original bytes: {err}"));
                    None
                }
            },
            None => match self.pipeline.reencrypt(entry, payload, entry.output_encryption()) {
                Ok(bytes) => Some(Encoded {
                    bytes,
                    size_compressed: entry.size_compressed,
                    size_decompressed: entry.size_decompressed,
                    compression: entry.compression,
                }),
                Err(err) => {
                    ctx.recover(local, entry, format!("kept original bytes: {err}"));
                    None
                }
            },
        };

        match rewritten {
            Some(encoded) => append_encoded(&mut self.spool, &mut entries[local], encoded),
            None => carry_through(&mut self.reader, &mut self.blocks, &mut self.spool, entries, local),
        }
    }

    fn finish(self, _ctx: &mut WorkerContext, _entries: &mut [Entry]) -> Result<SpoolFile, EngineError> {
        self.spool.finish()
    }
}
