//! Cooperative pause/resume and cancellation primitives shared by the
//! coordinator and its workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct GateState {
    paused: bool,
    /// Threads currently parked in [`PauseGate::pause`].
    waiting: usize,
}

/// A binary Running/Paused gate.
///
/// Workers call [`pause`](PauseGate::pause) between two entries. While the gate
/// is armed the call parks the thread on a condition variable, so a paused
/// worker costs no CPU. Disarming wakes every parked thread immediately.
#[derive(Debug, Default)]
pub struct PauseGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms (`true`) or disarms (`false`) the gate.
    pub fn set_paused(&self, paused: bool) {
        let mut guard = self.lock();
        guard.paused = paused;
        if !paused {
            self.cv.notify_all();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Number of threads parked right now.
    pub fn waiting(&self) -> usize {
        self.lock().waiting
    }

    /// Blocks while the gate is armed. Returns immediately otherwise.
    pub fn pause(&self) {
        let mut guard = self.lock();
        if !guard.paused {
            return;
        }
        guard.waiting += 1;
        while guard.paused {
            guard = self.cv.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
        guard.waiting -= 1;
    }
}

/// Shared cancellation flag, polled by workers once per entry.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
