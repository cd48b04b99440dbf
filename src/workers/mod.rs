//! # Transform workers
//!
//! Every pass runs one worker per contiguous index range. A worker owns its
//! slice of the entry list exclusively for the lifetime of the pass, so entry
//! fields are mutated without locks.
//!
//! All variants share the same loop ([`run_worker`]): wait at the pause gate,
//! check for cancellation, process one entry, bump the processed counter. The
//! per-entry behavior lives behind [`EntryTask`]:
//!
//! - [`extract::ExtractTask`]: decode entries to plain files.
//! - [`repack::RepackTask`]: rewrite payloads into the worker's spool.
//! - [`compress::CompressAddedTask`] and [`compress::CompressSmallTask`]: encode staged files.
//! - [`inspect::TransformTask`], [`inspect::HashTask`], [`inspect::ClassifyTask`]: read-only passes.

pub mod compress;
pub mod extract;
pub mod inspect;
pub mod repack;
pub mod spool;

use std::io::{Read, Seek};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::entry::Entry;
use crate::error::EngineError;
use crate::gate::{CancelToken, PauseGate};
use crate::pipeline::{Encoded, EntryFailure};
use crate::planner::BlockReader;
use crate::workers::spool::OutputSpool;

/// Per-worker information handed to every [`EntryTask`] call.
#[derive(Debug)]
pub struct WorkerContext {
    pub worker: usize,
    /// Global index of the first entry in the worker's slice.
    pub start: usize,
    pub recovered: Vec<EntryFailure>,
}

impl WorkerContext {
    pub fn new(worker: usize, start: usize) -> Self {
        Self { worker, start, recovered: Vec::new() }
    }

    /// Records a non-fatal per-entry failure. `local` is the index inside the worker's slice.
    pub fn recover(&mut self, local: usize, entry: &Entry, reason: impl ToString) {
        let failure = EntryFailure { index: self.start + local, path: entry.path.clone(), reason: reason.to_string() };
        warn!(worker = self.worker, entry = %failure.path, reason = %failure.reason, "entry failed, continuing");
        self.recovered.push(failure);
    }
}

/// Per-entry behavior of one worker variant.
pub trait EntryTask: Send {
    type Output: Send;

    /// Runs once before the first entry.
    fn begin(&mut self, _ctx: &mut WorkerContext, _entries: &mut [Entry]) -> Result<(), EngineError> {
        Ok(())
    }

    /// Processes `entries[local]`. An `Err` is fatal to the whole pass;
    /// recoverable problems go to [`WorkerContext::recover`].
    fn process(&mut self, ctx: &mut WorkerContext, entries: &mut [Entry], local: usize) -> Result<(), EngineError>;

    fn finish(self, ctx: &mut WorkerContext, entries: &mut [Entry]) -> Result<Self::Output, EngineError>;
}

/// Bookkeeping the coordinator reads while a worker runs.
#[derive(Debug)]
pub struct WorkerState {
    pub index: usize,
    pub range: Range<usize>,
    processed: AtomicUsize,
    terminal: AtomicBool,
    failed: AtomicBool,
    panicked: AtomicBool,
    error: Mutex<Option<EngineError>>,
    pub gate: PauseGate,
}

impl WorkerState {
    pub fn new(index: usize, range: Range<usize>) -> Self {
        Self {
            index,
            range,
            processed: AtomicUsize::new(0),
            terminal: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            error: Mutex::new(None),
            gate: PauseGate::new(),
        }
    }

    /// Entries finished so far; may lag behind by one tick.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn has_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Takes the captured failure, if any.
    pub fn take_error(&self) -> Option<EngineError> {
        self.error.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn fail(&self, err: EngineError) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        self.failed.store(true, Ordering::Release);
    }

    fn mark_panicked(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    fn mark_terminal(&self) {
        self.terminal.store(true, Ordering::Release);
    }
}

/// What a worker hands back to the coordinator when it completes its range.
#[derive(Debug)]
pub struct WorkerOutput<T> {
    pub output: T,
    pub recovered: Vec<EntryFailure>,
}

/// Runs `task` over `entries` (the worker's own slice). Returns `None` when
/// the worker stopped early, either because `stop` was raised or because it
/// failed; a failure is stored in `state` and raises `stop` for the others.
pub fn run_worker<T: EntryTask>(
    state: &WorkerState,
    stop: &CancelToken,
    task: T,
    entries: &mut [Entry],
) -> Option<WorkerOutput<T::Output>> {
    // Runs on unwind too: a panic stops the siblings and still ends the monitoring loop.
    let _terminal = scopeguard::guard((), |_| {
        if std::thread::panicking() {
            state.mark_panicked();
            stop.cancel();
        }
        state.mark_terminal();
    });

    let mut ctx = WorkerContext::new(state.index, state.range.start);
    debug!(worker = state.index, start = state.range.start, end = state.range.end, "worker started");
    match drive(state, stop, task, &mut ctx, entries) {
        Ok(output) => {
            debug!(worker = state.index, recovered = ctx.recovered.len(), "worker finished");
            Some(WorkerOutput { output, recovered: ctx.recovered })
        }
        Err(EngineError::Cancelled) => {
            debug!(worker = state.index, "worker stopped");
            None
        }
        Err(err) => {
            warn!(worker = state.index, error = %err, "worker failed");
            state.fail(err);
            stop.cancel();
            None
        }
    }
}

fn drive<T: EntryTask>(
    state: &WorkerState,
    stop: &CancelToken,
    mut task: T,
    ctx: &mut WorkerContext,
    entries: &mut [Entry],
) -> Result<T::Output, EngineError> {
    task.begin(ctx, entries)?;
    for local in 0..entries.len() {
        state.gate.pause();
        if stop.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        task.process(ctx, entries, local)?;
        state.processed.fetch_add(1, Ordering::Relaxed);
    }
    task.finish(ctx, entries)
}

/// Appends a freshly encoded payload and records the entry's new layout.
pub(crate) fn append_encoded(spool: &mut OutputSpool, entry: &mut Entry, encoded: Encoded) -> Result<(), EngineError> {
    entry.temporary_offset = spool.append(&encoded.bytes)?;
    entry.temporary_size_compressed_alignment = encoded.bytes.len() as u64;
    entry.new_size_compressed = encoded.size_compressed;
    entry.new_size_decompressed = encoded.size_decompressed;
    entry.new_compression = Some(encoded.compression);
    entry.new_encryption = Some(entry.output_encryption());
    Ok(())
}

/// Appends the stored bytes of `entries[local]` to `spool` unchanged and
/// records where they went. Shared by every pass that carries entries through.
pub(crate) fn carry_through<R: Read + Seek>(
    reader: &mut R,
    blocks: &mut BlockReader,
    spool: &mut OutputSpool,
    entries: &mut [Entry],
    local: usize,
) -> Result<(), EngineError> {
    let end = entries.len();
    if entries[local].has_source_payload() {
        blocks.ensure(reader, entries, local, end)?;
    }
    let entry = &mut entries[local];
    let offset = if entry.has_source_payload() {
        let bytes = blocks.payload(entry);
        spool.append(bytes)?
    } else {
        spool.position()
    };
    entry.temporary_offset = offset;
    entry.temporary_size_compressed_alignment = entry.target_alignment();
    entry.new_size_compressed = entry.size_compressed;
    entry.new_size_decompressed = entry.size_decompressed;
    Ok(())
}
