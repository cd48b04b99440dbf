//! Read-only passes: generic transform, hashing and encryption classification.

use std::fmt;
use std::io::{Read, Seek};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::LZMA_MARKER;
use crate::entry::{Classification, CompressionKind, Entry};
use crate::error::EngineError;
use crate::pipeline::Pipeline;
use crate::planner::BlockReader;
use crate::scan_cache::ForwardScanCache;
use crate::workers::{EntryTask, WorkerContext};

/// Caller hook for [`TransformTask`]; receives the entry and its plaintext.
pub type EntryCallback = Arc<dyn Fn(&Entry, &[u8]) -> Result<(), EngineError> + Send + Sync>;

/// Digest function for [`HashTask`].
pub type HashFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// True when the first two bytes form a valid zlib header.
pub fn is_zlib_header(bytes: &[u8]) -> bool {
    match bytes {
        [cmf, flg, ..] => cmf & 0x0F == 8 && ((*cmf as u16) << 8 | *flg as u16) % 31 == 0,
        _ => false,
    }
}

/// Classifies a stored entry from its first two bytes, or `None` when the
/// entry is already flagged as encrypted.
pub fn classify_signature(entry: &Entry, head: [u8; 2]) -> Option<Classification> {
    if entry.encryption.is_encrypted() {
        return None;
    }
    if head[0] == LZMA_MARKER {
        return Some(Classification::Lzma);
    }
    if is_zlib_header(&head) || entry.compression != CompressionKind::Generic {
        return Some(Classification::Normal);
    }
    Some(Classification::LegacyEncrypted)
}

/// Cheap check on decrypted bytes before running the full decode chain.
pub fn signature_plausible(kind: CompressionKind, decrypted: &[u8]) -> bool {
    match kind {
        CompressionKind::Generic => decrypted.first() == Some(&LZMA_MARKER) || is_zlib_header(decrypted),
        CompressionKind::Lzss | CompressionKind::Raw | CompressionKind::None => true,
    }
}

fn is_readable(entry: &Entry) -> bool {
    !entry.is_removed() && !entry.directory && !entry.is_added()
}

/// Decodes each readable entry and hands the plaintext to a callback.
/// Entries whose decrypted bytes do not look like their flag are skipped.
pub struct TransformTask<R> {
    pipeline: Arc<Pipeline>,
    reader: R,
    blocks: BlockReader,
    callback: EntryCallback,
    visited: usize,
}

impl<R: Read + Seek + Send> TransformTask<R> {
    pub fn new(pipeline: Arc<Pipeline>, reader: R, block_budget: u64, callback: EntryCallback) -> Self {
        Self { pipeline, reader, blocks: BlockReader::new(block_budget), callback, visited: 0 }
    }
}

impl<R: Read + Seek + Send> EntryTask for TransformTask<R> {
    /// Number of entries handed to the callback.
    type Output = usize;

    fn begin(&mut self, _ctx: &mut WorkerContext, entries: &mut [Entry]) -> Result<(), EngineError> {
        entries.iter_mut().for_each(Entry::reset_working);
        Ok(())
    }

    fn process(&mut self, ctx: &mut WorkerContext, entries: &mut [Entry], local: usize) -> Result<(), EngineError> {
        if !is_readable(&entries[local]) {
            return Ok(());
        }
        if !entries[local].has_source_payload() {
            (self.callback)(&entries[local], &[])?;
            self.visited += 1;
            return Ok(());
        }
        let end = entries.len();
        self.blocks.ensure(&mut self.reader, entries, local, end)?;
        let entry = &entries[local];
        let mut decrypted = self.blocks.payload(entry).to_vec();
        if let Err(err) = self.pipeline.crypto.decrypt_in_place(entry.encryption, &mut decrypted, entry.size_compressed) {
            ctx.recover(local, entry, err);
            return Ok(());
        }
        decrypted.truncate(entry.size_compressed as usize);
        if !signature_plausible(entry.compression, &decrypted) {
            return Ok(());
        }
        match self.pipeline.chain.decode(entry.compression, &decrypted, usize::try_from(entry.size_decompressed).unwrap_or(usize::MAX)) {
            Ok(decoded) => {
                (self.callback)(entry, &decoded.bytes)?;
                self.visited += 1;
            }
            Err(err) => ctx.recover(local, entry, err),
        }
        Ok(())
    }

    fn finish(self, _ctx: &mut WorkerContext, _entries: &mut [Entry]) -> Result<usize, EngineError> {
        Ok(self.visited)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    #[default]
    Blake3,
    Sha256,
    Crc32,
}

impl HashKind {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Blake3 => blake3::hash(data).as_bytes().to_vec(),
            HashKind::Sha256 => Sha256::digest(data).to_vec(),
            HashKind::Crc32 => crc32fast::hash(data).to_be_bytes().to_vec(),
        }
    }

    pub fn hasher(self) -> HashFn {
        Arc::new(move |data: &[u8]| self.digest(data))
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashKind::Blake3 => "blake3",
            HashKind::Sha256 => "sha256",
            HashKind::Crc32 => "crc32",
        };
        f.write_str(name)
    }
}

/// Hashes the plaintext of every readable entry, recording `path -> digest`.
pub struct HashTask<R> {
    pipeline: Arc<Pipeline>,
    reader: R,
    blocks: BlockReader,
    hasher: HashFn,
    digests: Vec<(String, Vec<u8>)>,
}

impl<R: Read + Seek + Send> HashTask<R> {
    pub fn new(pipeline: Arc<Pipeline>, reader: R, block_budget: u64, hasher: HashFn) -> Self {
        Self { pipeline, reader, blocks: BlockReader::new(block_budget), hasher, digests: Vec::new() }
    }
}

impl<R: Read + Seek + Send> EntryTask for HashTask<R> {
    type Output = Vec<(String, Vec<u8>)>;

    fn begin(&mut self, _ctx: &mut WorkerContext, entries: &mut [Entry]) -> Result<(), EngineError> {
        entries.iter_mut().for_each(Entry::reset_working);
        Ok(())
    }

    fn process(&mut self, ctx: &mut WorkerContext, entries: &mut [Entry], local: usize) -> Result<(), EngineError> {
        if !is_readable(&entries[local]) {
            return Ok(());
        }
        if !entries[local].has_source_payload() {
            let digest = (self.hasher)(&[]);
            self.digests.push((entries[local].path.clone(), digest));
            return Ok(());
        }
        let end = entries.len();
        self.blocks.ensure(&mut self.reader, entries, local, end)?;
        let entry = &entries[local];
        match self.pipeline.decode(entry, self.blocks.payload(entry)) {
            Ok(decoded) => self.digests.push((entry.path.clone(), (self.hasher)(&decoded.bytes))),
            Err(err) => ctx.recover(local, entry, err),
        }
        Ok(())
    }

    fn finish(self, _ctx: &mut WorkerContext, _entries: &mut [Entry]) -> Result<Self::Output, EngineError> {
        Ok(self.digests)
    }
}

/// Tallies of one classification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts {
    pub normal: usize,
    pub lzma: usize,
    pub legacy_encrypted: usize,
    pub skipped: usize,
}

impl ClassCounts {
    pub fn merge(mut self, other: ClassCounts) -> ClassCounts {
        self.normal += other.normal;
        self.lzma += other.lzma;
        self.legacy_encrypted += other.legacy_encrypted;
        self.skipped += other.skipped;
        self
    }
}

/// Reads the first two bytes of each entry through a forward-scan cache and
/// sets [`Entry::classification`]. No payload is decoded.
///
/// The worker's slice is visited in ascending offset order, whatever the
/// catalog order, since the cache only reads forward.
pub struct ClassifyTask<R> {
    cache: ForwardScanCache<R>,
    counts: ClassCounts,
    order: Vec<usize>,
}

impl<R: Read + Seek + Send> ClassifyTask<R> {
    pub fn new(reader: R, buffer_size: usize) -> Result<Self, EngineError> {
        Ok(Self { cache: ForwardScanCache::new(reader, buffer_size)?, counts: ClassCounts::default(), order: Vec::new() })
    }
}

impl<R: Read + Seek + Send> EntryTask for ClassifyTask<R> {
    type Output = ClassCounts;

    fn begin(&mut self, _ctx: &mut WorkerContext, entries: &mut [Entry]) -> Result<(), EngineError> {
        self.order = (0..entries.len()).collect();
        self.order.sort_by_key(|&i| entries[i].offset);
        Ok(())
    }

    fn process(&mut self, _ctx: &mut WorkerContext, entries: &mut [Entry], local: usize) -> Result<(), EngineError> {
        let entry = &mut entries[self.order[local]];
        if !is_readable(entry) || !entry.has_source_payload() || entry.size_compressed < 2 {
            self.counts.skipped += 1;
            return Ok(());
        }
        let mut head = [0u8; 2];
        self.cache.read_into(entry.offset, &mut head)?;
        entry.classification = classify_signature(entry, head);
        match entry.classification {
            Some(Classification::Normal) => self.counts.normal += 1,
            Some(Classification::Lzma) => self.counts.lzma += 1,
            Some(Classification::LegacyEncrypted) => self.counts.legacy_encrypted += 1,
            None => self.counts.skipped += 1,
        }
        Ok(())
    }

    fn finish(self, _ctx: &mut WorkerContext, _entries: &mut [Entry]) -> Result<ClassCounts, EngineError> {
        Ok(self.counts)
    }
}
