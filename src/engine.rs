//! # Engine
//!
//! Caller-facing entry points. Each one runs a single multi-threaded pass over
//! an index range of the entry list:
//!
//! | method | worker | result |
//! |---|---|---|
//! | [`Engine::extract_range`] | extract | files under an output directory |
//! | [`Engine::repack_range`] | repack / defragment | a [`SpoolPass`] to dump |
//! | [`Engine::compress_added_range`] | compress (plain or batched small files) | a [`SpoolPass`] to dump |
//! | [`Engine::transform_range`] | generic transform | caller callback per entry |
//! | [`Engine::scan_range`] | hash | `path -> digest` |
//! | [`Engine::classify_encryption_range`] | classification | flags on the entries |
//!
//! Every pass honours the engine's [`CancelToken`] and progress callback.

use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tempfile::TempDir;
use tracing::info;

use crate::autotune::{CpuProbe, SystemCpuProbe};
use crate::codec::Method;
use crate::config::EngineConfig;
use crate::crypto::CryptoLayers;
use crate::entry::Entry;
use crate::error::EngineError;
use crate::gate::CancelToken;
use crate::pipeline::{EntryFailure, Pipeline};
use crate::pool::{PassReport, PoolConfig, SpoolPass, ThreadPool};
use crate::progress::{ProgressCallback, ProgressState};
use crate::source::Source;
use crate::workers::compress::{CompressAddedTask, CompressSmallTask};
use crate::workers::extract::ExtractTask;
use crate::workers::inspect::{ClassCounts, ClassifyTask, EntryCallback, HashFn, HashTask, TransformTask};
use crate::workers::repack::{RepackOptions, RepackTask};
use crate::workers::spool::OutputSpool;
use crate::workers::EntryTask;

const REPACK_SPOOL_BUFFER: usize = 1024 * 1024;

/// Outcome of a pass that does not produce spool files.
#[derive(Debug)]
pub struct PassSummary<T> {
    pub value: T,
    pub recovered: Vec<EntryFailure>,
}

pub struct Engine<S: Source> {
    source: S,
    config: EngineConfig,
    pipeline: Arc<Pipeline>,
    probe: Mutex<Box<dyn CpuProbe + Send>>,
    threads: Option<usize>,
    progress: Option<Arc<ProgressCallback>>,
    cancel: CancelToken,
    token: String,
}

impl<S: Source> Engine<S> {
    pub fn new(source: S, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let pipeline = Arc::new(Pipeline::new(CryptoLayers::new(config.secondary_key.as_deref())));
        let token = format!(
            "{:08x}",
            crc32fast::hash(format!("{}:{}", source.describe(), std::process::id()).as_bytes())
        );
        Ok(Self {
            source,
            config,
            pipeline,
            probe: Mutex::new(Box::new(SystemCpuProbe::new())),
            threads: None,
            progress: None,
            cancel: CancelToken::new(),
            token,
        })
    }

    /// Replaces the CPU probe used for throttling.
    pub fn with_probe(self, probe: impl CpuProbe + Send + 'static) -> Self {
        Self { probe: Mutex::new(Box::new(probe)), ..self }
    }

    /// Fixes the worker count instead of `min(entries, max_threads)`.
    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads.filter(|t| *t > 0);
        self
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressState) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn check_range(entries: &[Entry], range: &Range<usize>) -> Result<(), EngineError> {
        if range.start > range.end || range.end > entries.len() {
            return Err(EngineError::Config(format!(
                "range {:?} is outside the entry list ({} entries)",
                range,
                entries.len()
            )));
        }
        Ok(())
    }

    fn run<T, F>(&self, entries: &mut [Entry], range: Range<usize>, make_task: F) -> Result<PassReport<T::Output>, EngineError>
    where
        T: EntryTask,
        F: FnMut(usize, Range<usize>) -> Result<T, EngineError>,
    {
        Self::check_range(entries, &range)?;
        let mut pool_config = PoolConfig::from(&self.config);
        pool_config.threads = self.threads;

        let mut probe = self.probe.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pool = ThreadPool::new(pool_config, &mut **probe);
        let mut report = pool.run(&mut entries[range.clone()], make_task, self.progress.clone(), &self.cancel)?;
        for failure in &mut report.recovered {
            failure.index += range.start;
        }
        Ok(report)
    }

    fn pass_dir(&self) -> Result<TempDir, EngineError> {
        let root = self.config.temp_root();
        fs::create_dir_all(&root).map_err(|e| EngineError::io_at(e, &root))?;
        tempfile::Builder::new()
            .prefix("packforge-")
            .tempdir_in(&root)
            .map_err(|e| EngineError::io_at(e, &root))
    }

    fn summary<T>(report: PassReport<T>) -> PassSummary<Vec<T>> {
        PassSummary { value: report.outputs, recovered: report.recovered }
    }

    /// Writes the plaintext of `entries[range]` under `out_dir`. Returns the
    /// number of files and directories written.
    pub fn extract_range(
        &self,
        entries: &mut [Entry],
        range: Range<usize>,
        out_dir: &Path,
    ) -> Result<PassSummary<usize>, EngineError> {
        fs::create_dir_all(out_dir).map_err(|e| EngineError::io_at(e, out_dir))?;
        let budget = self.config.block_budget;
        let report = self.run(entries, range, |_, _| {
            Ok(ExtractTask::new(Arc::clone(&self.pipeline), self.source.open_reader()?, budget, out_dir))
        })?;
        let summary = Self::summary(report);
        let written: usize = summary.value.iter().sum();
        info!(written, recovered = summary.recovered.len(), "extract finished");
        Ok(PassSummary { value: written, recovered: summary.recovered })
    }

    /// Rewrites `entries[range]` into per-worker spool files. Call
    /// [`SpoolPass::dump`] to merge them and fix the entries' layout.
    pub fn repack_range(
        &self,
        entries: &mut [Entry],
        range: Range<usize>,
        options: RepackOptions,
    ) -> Result<SpoolPass, EngineError> {
        let dir = self.pass_dir()?;
        let budget = self.config.block_budget;
        let span = range.clone();
        let report = self.run(entries, range, |_, worker_range| {
            let spool = OutputSpool::create(dir.path(), &self.token, span.start + worker_range.start, REPACK_SPOOL_BUFFER)?;
            Ok(RepackTask::new(Arc::clone(&self.pipeline), self.source.open_reader()?, budget, spool, options))
        })?;
        Ok(SpoolPass::new(dir, report, span, self.config.max_archive_size))
    }

    /// Encodes the entries of `entries[range]` staged as added; other stored
    /// entries are carried through unchanged. Many small staged files switch
    /// to the batched small-file worker.
    pub fn compress_added_range(
        &self,
        entries: &mut [Entry],
        range: Range<usize>,
        method: Method,
    ) -> Result<SpoolPass, EngineError> {
        Self::check_range(entries, &range)?;
        let (count, bytes) = entries[range.clone()]
            .iter()
            .filter(|e| e.is_added())
            .fold((0usize, 0u64), |(n, b), e| (n + 1, b + e.size_decompressed));
        let batched = count >= self.config.small_file_count && bytes / count.max(1) as u64 <= self.config.small_file_avg;
        info!(staged = count, bytes, batched, "compressing staged files");

        let dir = self.pass_dir()?;
        let budget = self.config.block_budget;
        let threshold = self.config.flush_threshold;
        let span = range.clone();
        let make_plain = |worker_range: Range<usize>| -> Result<CompressAddedTask<S::Reader>, EngineError> {
            let spool = OutputSpool::create(dir.path(), &self.token, span.start + worker_range.start, threshold)?;
            Ok(CompressAddedTask::new(Arc::clone(&self.pipeline), self.source.open_reader()?, budget, spool, method))
        };

        let report = if batched {
            self.run(entries, range, |_, worker_range| Ok(CompressSmallTask::new(make_plain(worker_range)?, dir.path())))?
        } else {
            self.run(entries, range, |_, worker_range| make_plain(worker_range))?
        };
        Ok(SpoolPass::new(dir, report, span, self.config.max_archive_size))
    }

    /// Decodes every readable entry and hands the plaintext to `callback`.
    pub fn transform_range(
        &self,
        entries: &mut [Entry],
        range: Range<usize>,
        callback: EntryCallback,
    ) -> Result<PassSummary<usize>, EngineError> {
        let budget = self.config.block_budget;
        let report = self.run(entries, range, |_, _| {
            Ok(TransformTask::new(Arc::clone(&self.pipeline), self.source.open_reader()?, budget, Arc::clone(&callback)))
        })?;
        let summary = Self::summary(report);
        Ok(PassSummary { value: summary.value.iter().sum(), recovered: summary.recovered })
    }

    /// Hashes the plaintext of every readable entry, in entry order.
    pub fn scan_range(
        &self,
        entries: &mut [Entry],
        range: Range<usize>,
        hasher: HashFn,
    ) -> Result<PassSummary<Vec<(String, Vec<u8>)>>, EngineError> {
        let budget = self.config.block_budget;
        let report = self.run(entries, range, |_, _| {
            Ok(HashTask::new(Arc::clone(&self.pipeline), self.source.open_reader()?, budget, Arc::clone(&hasher)))
        })?;
        let summary = Self::summary(report);
        Ok(PassSummary { value: summary.value.into_iter().flatten().collect(), recovered: summary.recovered })
    }

    /// Flags each entry of `entries[range]` from its first two stored bytes.
    pub fn classify_encryption_range(&self, entries: &mut [Entry], range: Range<usize>) -> Result<ClassCounts, EngineError> {
        let buffer = self.config.scan_buffer_size;
        let report = self.run(entries, range, |_, _| ClassifyTask::new(self.source.open_reader()?, buffer))?;
        let counts = report.outputs.into_iter().fold(ClassCounts::default(), ClassCounts::merge);
        info!(?counts, "classification finished");
        Ok(counts)
    }
}
