//! Progress reporting for multi-threaded passes.
//!
//! Workers only bump their own processed counter; the coordinator aggregates
//! the counters on every poll tick and pushes a [`ProgressState`] through the
//! callback from its own thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot of a running pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    pub total_entries: u64,
    pub processed_entries: u64,
    pub running_workers: u32,
    pub paused_workers: u32,
    pub elapsed_time: Duration,
    pub progress_percent: f32,
}

impl ProgressState {
    /// Estimated time remaining based on the entry rate so far.
    pub fn estimated_time_remaining(&self) -> Duration {
        if self.processed_entries == 0 {
            return Duration::from_secs(0);
        }
        let per_entry = self.elapsed_time.as_secs_f64() / self.processed_entries as f64;
        let remaining = self.total_entries.saturating_sub(self.processed_entries);
        Duration::from_secs_f64(per_entry * remaining as f64)
    }
}

/// Progress callback function type
pub type ProgressCallback = dyn Fn(ProgressState) + Send + Sync;

/// Aggregates worker counters into [`ProgressState`] snapshots.
pub struct ProgressTracker {
    total_entries: u64,
    start_time: Instant,
    callback: Option<Arc<ProgressCallback>>,
}

impl ProgressTracker {
    pub fn new(total_entries: usize, callback: Option<Arc<ProgressCallback>>) -> Self {
        Self { total_entries: total_entries as u64, start_time: Instant::now(), callback }
    }

    pub fn snapshot(&self, processed: usize, running: usize, paused: usize) -> ProgressState {
        let processed_entries = processed as u64;
        let progress_percent = if self.total_entries > 0 {
            (processed_entries as f32 / self.total_entries as f32 * 100.0).min(100.0)
        } else {
            100.0
        };
        ProgressState {
            total_entries: self.total_entries,
            processed_entries,
            running_workers: running as u32,
            paused_workers: paused as u32,
            elapsed_time: self.start_time.elapsed(),
            progress_percent,
        }
    }

    pub fn emit(&self, processed: usize, running: usize, paused: usize) {
        if let Some(ref callback) = self.callback {
            callback(self.snapshot(processed, running, paused));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn percent_is_processed_over_total() {
        let tracker = ProgressTracker::new(200, None);
        let state = tracker.snapshot(50, 3, 1);
        assert_eq!(state.progress_percent, 25.0);
        assert_eq!(state.running_workers, 3);
        assert_eq!(state.paused_workers, 1);
    }

    #[test]
    fn empty_pass_reports_complete() {
        let tracker = ProgressTracker::new(0, None);
        assert_eq!(tracker.snapshot(0, 0, 0).progress_percent, 100.0);
    }

    #[test]
    fn callback_receives_updates() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let callback: Arc<ProgressCallback> = Arc::new(move |state: ProgressState| {
            sink.lock().unwrap().push(state.progress_percent);
        });
        let tracker = ProgressTracker::new(4, Some(callback));
        tracker.emit(1, 1, 0);
        tracker.emit(4, 0, 0);
        assert_eq!(*updates.lock().unwrap(), vec![25.0, 100.0]);
    }

    #[test]
    fn eta_scales_with_remaining_entries() {
        let state = ProgressState {
            total_entries: 100,
            processed_entries: 25,
            running_workers: 1,
            paused_workers: 0,
            elapsed_time: Duration::from_secs(10),
            progress_percent: 25.0,
        };
        let eta = state.estimated_time_remaining().as_secs_f64();
        assert!((eta - 30.0).abs() < 0.01);
    }
}
