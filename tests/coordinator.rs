//! Coordinator behaviour under load, cancellation and worker failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use packforge::entry::Entry;
use packforge::pool::{PoolConfig, ThreadPool};
use packforge::progress::{ProgressCallback, ProgressState};
use packforge::workers::{EntryTask, WorkerContext};
use packforge::{CancelToken, EngineError};

/// Sleeps per entry and counts how many entries each worker handled.
struct Slow {
    delay: Duration,
    counter: Arc<AtomicUsize>,
    fail_at: Option<usize>,
    panic_at: Option<usize>,
}

impl EntryTask for Slow {
    type Output = usize;

    fn process(&mut self, ctx: &mut WorkerContext, _entries: &mut [Entry], local: usize) -> Result<(), EngineError> {
        let global = ctx.start + local;
        if self.panic_at == Some(global) {
            panic!("boom at {global}");
        }
        if self.fail_at == Some(global) {
            return Err(EngineError::Format(format!("bad entry {global}")));
        }
        thread::sleep(self.delay);
        self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finish(self, _ctx: &mut WorkerContext, entries: &mut [Entry]) -> Result<usize, EngineError> {
        Ok(entries.len())
    }
}

fn entries(count: usize) -> Vec<Entry> {
    (0..count).map(|i| Entry::stored(&format!("e{i}"), 0, 0, 0)).collect()
}

fn config(threads: usize, delayed_start: usize) -> PoolConfig {
    PoolConfig {
        threads: Some(threads),
        monitor_cpu: true,
        delayed_start,
        critical_cpu: 80.0,
        cooldown_ticks: 0,
        poll_fast: Duration::from_millis(2),
        ..PoolConfig::default()
    }
}

fn recorder() -> (Arc<Mutex<Vec<ProgressState>>>, Arc<ProgressCallback>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: Arc<ProgressCallback> = Arc::new(move |state: ProgressState| sink.lock().unwrap().push(state));
    (seen, callback)
}

type Counters = Vec<Arc<AtomicUsize>>;

fn counters(n: usize) -> Counters {
    (0..n).map(|_| Arc::new(AtomicUsize::new(0))).collect()
}

#[test]
fn saturated_cpu_still_finishes_the_pass() {
    let mut list = entries(80);
    let mut probe = || 100.0f32;
    let (seen, callback) = recorder();
    let counts = counters(4);
    let report = ThreadPool::new(config(4, 4), &mut probe)
        .run(
            &mut list,
            |worker, _| {
                Ok(Slow { delay: Duration::from_millis(2), counter: Arc::clone(&counts[worker]), fail_at: None, panic_at: None })
            },
            Some(callback),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(report.outputs, vec![20, 20, 20, 20]);
    assert!(counts.iter().all(|c| c.load(Ordering::Relaxed) == 20));
    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|s| s.paused_workers > 0), "the throttle never paused anyone");
    let last = seen.last().unwrap();
    assert_eq!(last.processed_entries, 80);
    assert_eq!(last.progress_percent, 100.0);
}

#[test]
fn idle_cpu_releases_every_delayed_worker() {
    let mut list = entries(160);
    let mut probe = || 5.0f32;
    let (seen, callback) = recorder();
    let counts = counters(4);
    ThreadPool::new(config(4, 1), &mut probe)
        .run(
            &mut list,
            |worker, _| {
                Ok(Slow { delay: Duration::from_millis(3), counter: Arc::clone(&counts[worker]), fail_at: None, panic_at: None })
            },
            Some(callback),
            &CancelToken::new(),
        )
        .unwrap();

    let max_running = seen.lock().unwrap().iter().map(|s| s.running_workers).max().unwrap_or(0);
    assert_eq!(max_running, 4);
}

#[test]
fn cancel_releases_paused_workers_promptly() {
    let mut list = entries(400);
    let mut probe = || 100.0f32;
    let counts = counters(4);
    let cancel = CancelToken::new();
    let cancelled_at = Arc::new(Mutex::new(None));

    let trigger = cancel.clone();
    let stamp = Arc::clone(&cancelled_at);
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        *stamp.lock().unwrap() = Some(Instant::now());
        trigger.cancel();
    });

    let result = ThreadPool::new(config(4, 1), &mut probe).run(
        &mut list,
        |worker, _| {
            Ok(Slow { delay: Duration::from_millis(5), counter: Arc::clone(&counts[worker]), fail_at: None, panic_at: None })
        },
        None,
        &cancel,
    );
    let returned = Instant::now();
    canceller.join().unwrap();

    assert!(matches!(result, Err(EngineError::Cancelled)), "{result:?}");
    assert!(result.as_ref().unwrap_err().is_cancellation());
    let cancelled = cancelled_at.lock().unwrap().expect("cancel fired");
    assert!(returned.duration_since(cancelled) < Duration::from_secs(1));
    // Workers 1..4 started paused under full load and never got to run.
    assert!(counts[0].load(Ordering::Relaxed) > 0);
    assert!(counts[1..].iter().all(|c| c.load(Ordering::Relaxed) == 0));
}

#[test]
fn failing_worker_aborts_the_pass() {
    let mut list = entries(200);
    let mut probe = || 0.0f32;
    let counts = counters(4);
    let result = ThreadPool::new(config(4, 4), &mut probe).run(
        &mut list,
        |worker, _| {
            Ok(Slow {
                delay: Duration::from_millis(1),
                counter: Arc::clone(&counts[worker]),
                fail_at: Some(120),
                panic_at: None,
            })
        },
        None,
        &CancelToken::new(),
    );
    match result {
        Err(EngineError::PassAborted { worker, source }) => {
            assert_eq!(worker, 2);
            assert!(source.to_string().contains("bad entry 120"));
        }
        other => panic!("expected PassAborted, got {other:?}"),
    }
    let total: usize = counts.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    assert!(total < 200);
}

#[test]
fn panicking_worker_is_reported() {
    let mut list = entries(40);
    let mut probe = || 0.0f32;
    let counts = counters(2);
    let result = ThreadPool::new(config(2, 2), &mut probe).run(
        &mut list,
        |worker, _| {
            Ok(Slow { delay: Duration::ZERO, counter: Arc::clone(&counts[worker]), fail_at: None, panic_at: Some(25) })
        },
        None,
        &CancelToken::new(),
    );
    assert!(matches!(result, Err(EngineError::WorkerPanicked { worker: 1 })), "{result:?}");
}

#[test]
fn panicking_worker_stops_its_siblings() {
    let mut list = entries(200);
    let mut idle_cpu = || 0.0f32;
    let counts = counters(2);
    let result = ThreadPool::new(config(2, 2), &mut idle_cpu).run(
        &mut list,
        |worker, _| {
            Ok(Slow {
                delay: Duration::from_millis(5),
                counter: Arc::clone(&counts[worker]),
                fail_at: None,
                panic_at: Some(100),
            })
        },
        None,
        &CancelToken::new(),
    );
    assert!(matches!(result, Err(EngineError::WorkerPanicked { worker: 1 })), "{result:?}");
    // Worker 0 owns 0..100 and would need ~500ms to finish it.
    assert!(counts[0].load(Ordering::Relaxed) < 50, "sibling ran {} entries", counts[0].load(Ordering::Relaxed));
}
