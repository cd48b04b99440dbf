//! # Adaptive thread pool
//!
//! Runs one [`EntryTask`] per contiguous index range on its own OS thread and
//! drives them from the calling thread:
//!
//! 1. The entry list is split into nearly equal ranges ([`partition`]); each
//!    worker gets an exclusive `&mut` slice of its range.
//! 2. The first `delayed_start` workers start right away. With CPU monitoring
//!    on, the rest start paused and are released one per tick while the CPU
//!    stays under the critical threshold.
//! 3. Every tick the coordinator samples CPU usage, applies the [`Throttle`]
//!    decision, checks for cancellation or a failed worker, and reports progress.
//! 4. Once every worker is terminal, the outputs are collected in worker order.
//!
//! [`SpoolPass::dump`] then merges the per-worker spool files into the final
//! stream and fixes every entry's offset.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::ops::Range;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::autotune::CpuProbe;
use crate::config::EngineConfig;
use crate::entry::{Entry, Modification};
use crate::error::EngineError;
use crate::gate::CancelToken;
use crate::pipeline::EntryFailure;
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::workers::spool::SpoolFile;
use crate::workers::{run_worker, EntryTask, WorkerOutput, WorkerState};

/// Buffer used when copying spool files into the output.
const DUMP_BUFFER: usize = 8 * 1024 * 1024;

/// Splits `[0, len)` into `parts` contiguous ranges whose sizes differ by at most one.
pub fn partition(len: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.clamp(1, len.max(1));
    let base = len / parts;
    let extra = len % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Explicit worker count; `None` means `min(entries, max_threads)`.
    pub threads: Option<usize>,
    pub max_threads: usize,
    pub delayed_start: usize,
    pub monitor_cpu: bool,
    pub critical_cpu: f32,
    pub cooldown_ticks: u32,
    pub small_pass_entries: usize,
    pub poll_fast: Duration,
    pub poll_slow: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for PoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            threads: None,
            max_threads: config.max_threads,
            delayed_start: config.delayed_start,
            monitor_cpu: config.monitor_cpu,
            critical_cpu: config.critical_cpu,
            cooldown_ticks: config.cooldown_ticks,
            small_pass_entries: config.small_pass_entries,
            poll_fast: Duration::from_millis(config.poll_fast_ms),
            poll_slow: Duration::from_millis(config.poll_slow_ms),
        }
    }
}

impl PoolConfig {
    pub fn worker_count(&self, entries: usize) -> usize {
        self.threads.unwrap_or(self.max_threads).min(entries).max(1)
    }

    pub fn poll_interval(&self, entries: usize) -> Duration {
        if entries < self.small_pass_entries {
            self.poll_fast
        } else {
            self.poll_slow
        }
    }
}

/// How the throttle sees one worker on a given tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLoad {
    Running,
    Paused,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    Idle,
    Pause(usize),
    Resume(usize),
}

/// CPU-driven pause/resume policy. Pure: the caller applies the action.
#[derive(Debug, Clone)]
pub struct Throttle {
    critical: f32,
    cooldown_ticks: u32,
    cooldown: u32,
}

impl Throttle {
    pub fn new(critical: f32, cooldown_ticks: u32) -> Self {
        Self { critical, cooldown_ticks, cooldown: 0 }
    }

    /// One tick. Resumes the lowest paused worker while below the threshold,
    /// pauses the highest running one at or above it, and never leaves the
    /// pool with no running worker.
    pub fn decide(&mut self, usage: f32, workers: &[WorkerLoad]) -> ThrottleAction {
        self.cooldown = self.cooldown.saturating_sub(1);
        let first_paused = workers.iter().position(|w| *w == WorkerLoad::Paused);
        let running = workers.iter().filter(|w| **w == WorkerLoad::Running).count();

        if running == 0 {
            return first_paused.map_or(ThrottleAction::Idle, ThrottleAction::Resume);
        }
        if usage < self.critical {
            return first_paused.map_or(ThrottleAction::Idle, ThrottleAction::Resume);
        }
        if self.cooldown == 0 && running > 1 {
            if let Some(last) = workers.iter().rposition(|w| *w == WorkerLoad::Running) {
                self.cooldown = self.cooldown_ticks;
                return ThrottleAction::Pause(last);
            }
        }
        ThrottleAction::Idle
    }
}

/// Result of a successful pass, in worker order.
#[derive(Debug)]
pub struct PassReport<T> {
    pub outputs: Vec<T>,
    pub recovered: Vec<EntryFailure>,
    /// Worker ranges, relative to the slice the pass ran over.
    pub ranges: Vec<Range<usize>>,
}

pub struct ThreadPool<'p> {
    config: PoolConfig,
    probe: &'p mut dyn CpuProbe,
}

impl<'p> ThreadPool<'p> {
    pub fn new(config: PoolConfig, probe: &'p mut dyn CpuProbe) -> Self {
        Self { config, probe }
    }

    /// Runs one pass over `entries`. `make_task` is called on this thread for
    /// every worker before any thread starts, with the worker index and its
    /// global index range.
    pub fn run<T, F>(
        &mut self,
        entries: &mut [Entry],
        mut make_task: F,
        progress: Option<Arc<ProgressCallback>>,
        cancel: &CancelToken,
    ) -> Result<PassReport<T::Output>, EngineError>
    where
        T: EntryTask,
        F: FnMut(usize, Range<usize>) -> Result<T, EngineError>,
    {
        let total = entries.len();
        let ranges = partition(total, self.config.worker_count(total));
        let tasks = ranges
            .iter()
            .enumerate()
            .map(|(i, range)| make_task(i, range.clone()))
            .collect::<Result<Vec<T>, EngineError>>()?;

        let states: Vec<WorkerState> =
            ranges.iter().enumerate().map(|(i, range)| WorkerState::new(i, range.clone())).collect();
        if self.config.monitor_cpu {
            for state in states.iter().skip(self.config.delayed_start.max(1)) {
                state.gate.set_paused(true);
            }
        }

        let interval = self.config.poll_interval(total);
        info!(entries = total, workers = states.len(), interval_ms = interval.as_millis() as u64, "pass started");
        let tracker = ProgressTracker::new(total, progress);
        let stop = CancelToken::new();

        let joined = thread::scope(|s| {
            let mut rest: &mut [Entry] = entries;
            let mut handles = Vec::with_capacity(states.len());
            for (state, task) in states.iter().zip(tasks) {
                let (mine, tail) = std::mem::take(&mut rest).split_at_mut(state.range.len());
                rest = tail;
                let stop = &stop;
                handles.push(s.spawn(move || run_worker(state, stop, task, mine)));
            }

            let first_failure = self.monitor(&states, interval, &tracker, cancel, &stop);

            let results: Vec<thread::Result<Option<WorkerOutput<T::Output>>>> =
                handles.into_iter().map(|h| h.join()).collect();
            (first_failure, results)
        });
        let (first_failure, results) = joined;

        let failed = first_failure.or_else(|| states.iter().position(WorkerState::has_failed));
        if let Some(worker) = failed {
            if let Some(source) = states[worker].take_error() {
                return Err(EngineError::PassAborted { worker, source: Box::new(source) });
            }
        }

        if let Some(worker) = results.iter().position(Result::is_err) {
            warn!(worker, "worker panicked");
            return Err(EngineError::WorkerPanicked { worker });
        }

        let mut outputs = Vec::with_capacity(results.len());
        let mut recovered = Vec::new();
        for result in results {
            match result {
                Err(_) | Ok(None) => return Err(EngineError::Cancelled),
                Ok(Some(out)) => {
                    outputs.push(out.output);
                    recovered.extend(out.recovered);
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        tracker.emit(total, 0, 0);
        info!(entries = total, recovered = recovered.len(), "pass finished");
        Ok(PassReport { outputs, recovered, ranges })
    }

    /// Coordinator loop. Returns the index of the first failed worker it saw.
    fn monitor(
        &mut self,
        states: &[WorkerState],
        interval: Duration,
        tracker: &ProgressTracker,
        cancel: &CancelToken,
        stop: &CancelToken,
    ) -> Option<usize> {
        let ticker = crossbeam_channel::tick(interval);
        let mut throttle = Throttle::new(self.config.critical_cpu, self.config.cooldown_ticks);
        let mut first_failure = None;
        let mut stopping = false;

        loop {
            if states.iter().all(WorkerState::is_terminal) {
                break;
            }

            if first_failure.is_none() {
                first_failure = states.iter().position(WorkerState::has_failed);
            }
            let panicked = states.iter().position(WorkerState::has_panicked);
            if !stopping && (cancel.is_cancelled() || stop.is_cancelled() || first_failure.is_some() || panicked.is_some()) {
                stopping = true;
                stop.cancel();
                info!(failed_worker = ?first_failure, panicked_worker = ?panicked, "stopping pass, releasing paused workers");
            }

            if stopping {
                for state in states {
                    state.gate.set_paused(false);
                }
            } else if self.config.monitor_cpu {
                let usage = self.probe.sample();
                let loads: Vec<WorkerLoad> = states.iter().map(load_of).collect();
                match throttle.decide(usage, &loads) {
                    ThrottleAction::Pause(i) => {
                        debug!(worker = i, usage, "cpu above threshold, pausing worker");
                        states[i].gate.set_paused(true);
                    }
                    ThrottleAction::Resume(i) => {
                        debug!(worker = i, usage, "resuming worker");
                        states[i].gate.set_paused(false);
                    }
                    ThrottleAction::Idle => {}
                }
            }

            let processed: usize = states.iter().map(WorkerState::processed).sum();
            let loads = states.iter().map(load_of);
            let running = loads.clone().filter(|l| *l == WorkerLoad::Running).count();
            let paused = loads.filter(|l| *l == WorkerLoad::Paused).count();
            tracker.emit(processed, running, paused);

            let _ = ticker.recv();
        }
        first_failure
    }
}

fn load_of(state: &WorkerState) -> WorkerLoad {
    if state.is_terminal() {
        WorkerLoad::Done
    } else if state.gate.is_paused() {
        WorkerLoad::Paused
    } else {
        WorkerLoad::Running
    }
}

/// The per-worker spool files of one pass, owned together with their temp directory.
#[derive(Debug)]
pub struct SpoolPass {
    dir: TempDir,
    pub spools: Vec<SpoolFile>,
    /// Worker ranges, relative to `span.start`.
    pub ranges: Vec<Range<usize>>,
    /// Global index range of the entry list the pass ran over.
    pub span: Range<usize>,
    pub recovered: Vec<EntryFailure>,
    pub max_archive_size: u64,
}

impl SpoolPass {
    pub fn new(dir: TempDir, report: PassReport<SpoolFile>, span: Range<usize>, max_archive_size: u64) -> Self {
        Self { dir, spools: report.outputs, ranges: report.ranges, span, recovered: report.recovered, max_archive_size }
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Total bytes the spools will contribute.
    pub fn data_len(&self) -> u64 {
        self.spools.iter().map(|s| s.len).sum()
    }

    /// Merges the spool files into `out` in worker order and rewrites the
    /// layout of `entries[span]`: offsets become prefix sums of the new aligned
    /// sizes starting at `base_offset`, and removed entries are dropped.
    /// Returns the number of bytes written.
    ///
    /// Fails before writing anything if the result would not be addressable.
    pub fn dump<W: Write>(self, entries: &mut Vec<Entry>, out: &mut W, base_offset: u64) -> Result<u64, EngineError> {
        let data_len = self.data_len();
        let required = base_offset.saturating_add(data_len);
        if required > self.max_archive_size {
            return Err(EngineError::Capacity { required, limit: self.max_archive_size });
        }
        let covered = self.ranges.last().map_or(0, |r| r.end);
        if self.span.end > entries.len() || covered != self.span.len() {
            return Err(EngineError::Layout(format!(
                "pass covered {:?} but the list holds {} entries",
                self.span,
                entries.len()
            )));
        }

        let pass = &entries[self.span.clone()];
        let mut cursor = base_offset;
        for (spool, range) in self.spools.iter().zip(&self.ranges) {
            let spool_start = cursor;
            for entry in &pass[range.clone()] {
                if entry.is_removed() {
                    continue;
                }
                if entry.temporary_size_compressed_alignment > 0 && spool_start + entry.temporary_offset != cursor {
                    return Err(EngineError::Layout(format!(
                        "entry '{}' sits at {} in its spool but the running offset is {}",
                        entry.path,
                        spool_start + entry.temporary_offset,
                        cursor
                    )));
                }
                cursor += entry.temporary_size_compressed_alignment;
            }
            if cursor - spool_start != spool.len {
                return Err(EngineError::Layout(format!(
                    "entries {:?} add up to {} bytes but their spool holds {}",
                    range,
                    cursor - spool_start,
                    spool.len
                )));
            }
        }

        let mut writer = BufWriter::with_capacity(DUMP_BUFFER, out);
        for spool in &self.spools {
            let file = File::open(&spool.path).map_err(|e| EngineError::io_at(e, &spool.path))?;
            let copied = io::copy(&mut BufReader::with_capacity(DUMP_BUFFER, file), &mut writer)
                .map_err(|e| EngineError::io_at(e, &spool.path))?;
            if copied != spool.len {
                return Err(EngineError::Layout(format!(
                    "spool {} holds {} bytes, expected {}",
                    spool.path.display(),
                    copied,
                    spool.len
                )));
            }
            fs::remove_file(&spool.path).map_err(|e| EngineError::io_at(e, &spool.path))?;
        }
        writer.flush()?;

        let tail = entries.split_off(self.span.end);
        let mut merged = entries.split_off(self.span.start);
        merged.retain(|e| !e.is_removed());
        let mut cursor = base_offset;
        for entry in merged.iter_mut() {
            entry.offset = cursor;
            entry.size_compressed_alignment = entry.temporary_size_compressed_alignment;
            entry.size_compressed = entry.new_size_compressed;
            entry.size_decompressed = entry.new_size_decompressed;
            if let Some(kind) = entry.new_compression.take() {
                entry.compression = kind;
            }
            if let Some(enc) = entry.new_encryption.take() {
                entry.encryption = enc;
            }
            entry.modification = Modification::Unchanged;
            entry.target_encryption = None;
            entry.source_path = None;
            cursor += entry.size_compressed_alignment;
            entry.reset_working();
        }
        entries.extend(merged);
        entries.extend(tail);

        info!(bytes = data_len, entries = entries.len(), "dump complete");
        Ok(data_len)
    }
}
