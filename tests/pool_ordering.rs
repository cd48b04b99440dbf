//! Workers finish in arbitrary order, but the merged stream must follow entry
//! order and every entry's offset must be the prefix sum of the aligned sizes.

use std::thread;
use std::time::Duration;

use packforge::entry::{align_up, Entry, Modification, ALIGNMENT};
use packforge::pool::{PoolConfig, SpoolPass, ThreadPool};
use packforge::workers::spool::{OutputSpool, SpoolFile};
use packforge::workers::{EntryTask, WorkerContext};
use packforge::{CancelToken, EngineError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BASE: u64 = 16;

/// Writes `size_compressed` bytes filled with the entry's tag, after a random delay.
struct Tagged {
    spool: OutputSpool,
    rng: StdRng,
}

fn tag_of(entry: &Entry) -> u8 {
    let index: usize = entry.path[1..].parse().unwrap();
    (index % 251) as u8
}

impl EntryTask for Tagged {
    type Output = SpoolFile;

    fn process(&mut self, _ctx: &mut WorkerContext, entries: &mut [Entry], local: usize) -> Result<(), EngineError> {
        thread::sleep(Duration::from_micros(self.rng.gen_range(0..400)));
        let entry = &mut entries[local];
        if entry.modification == Modification::Removed {
            return Ok(());
        }
        let bytes = vec![tag_of(entry); align_up(entry.size_compressed, ALIGNMENT) as usize];
        entry.temporary_offset = self.spool.append(&bytes)?;
        entry.temporary_size_compressed_alignment = bytes.len() as u64;
        entry.new_size_compressed = entry.size_compressed;
        entry.new_size_decompressed = entry.size_decompressed;
        Ok(())
    }

    fn finish(self, _ctx: &mut WorkerContext, _entries: &mut [Entry]) -> Result<SpoolFile, EngineError> {
        self.spool.finish()
    }
}

fn random_entries(count: usize, seed: u64) -> Vec<Entry> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let size = rng.gen_range(1..200u64);
            Entry::stored(&format!("e{i}"), 0, size, size)
        })
        .collect()
}

fn run_pass(entries: &mut Vec<Entry>, threads: usize) -> (Vec<u8>, u64) {
    let dir = tempfile::tempdir().unwrap();
    // Alternating load keeps the throttle pausing and resuming workers.
    let mut tick = 0u32;
    let mut probe = move || {
        tick += 1;
        if tick % 3 == 0 { 95.0f32 } else { 20.0 }
    };
    let config = PoolConfig {
        threads: Some(threads),
        delayed_start: 1,
        critical_cpu: 80.0,
        cooldown_ticks: 1,
        poll_fast: Duration::from_millis(1),
        ..PoolConfig::default()
    };
    let mut pool = ThreadPool::new(config, &mut probe);
    let report = pool
        .run(
            entries,
            |worker, range| {
                Ok(Tagged {
                    spool: OutputSpool::create(dir.path(), "order", range.start, 512)?,
                    rng: StdRng::seed_from_u64(worker as u64 + 7),
                })
            },
            None,
            &CancelToken::new(),
        )
        .unwrap();
    let len = entries.len();
    let pass = SpoolPass::new(dir, report, 0..len, u32::MAX as u64);
    let mut out = Vec::new();
    let written = pass.dump(entries, &mut out, BASE).unwrap();
    (out, written)
}

#[test]
fn dump_follows_entry_order_under_random_delays() {
    let mut entries = random_entries(300, 42);
    let expected_len: u64 = entries.iter().map(|e| align_up(e.size_compressed, ALIGNMENT)).sum();

    let (out, written) = run_pass(&mut entries, 6);
    assert_eq!(written, expected_len);
    assert_eq!(out.len() as u64, expected_len);

    let mut cursor = BASE;
    for entry in &entries {
        assert_eq!(entry.offset, cursor, "{}", entry.path);
        let start = (entry.offset - BASE) as usize;
        let stored = &out[start..start + entry.size_compressed_alignment as usize];
        assert!(stored.iter().all(|b| *b == tag_of(entry)), "{} holds foreign bytes", entry.path);
        cursor += entry.size_compressed_alignment;
    }
}

#[test]
fn removed_entries_leave_no_gap() {
    let mut entries = random_entries(120, 9);
    for entry in entries.iter_mut().step_by(5) {
        entry.modification = Modification::Removed;
    }
    let kept: Vec<String> = entries.iter().filter(|e| !e.is_removed()).map(|e| e.path.clone()).collect();

    let (out, written) = run_pass(&mut entries, 4);
    assert_eq!(entries.iter().map(|e| e.path.clone()).collect::<Vec<_>>(), kept);
    assert_eq!(written, out.len() as u64);

    let mut cursor = BASE;
    for entry in &entries {
        assert_eq!(entry.offset, cursor);
        assert_eq!(out[(entry.offset - BASE) as usize], tag_of(entry));
        cursor += entry.size_compressed_alignment;
    }
    assert_eq!(cursor - BASE, out.len() as u64);
}

#[test]
fn dump_refuses_unaddressable_output() {
    let mut entries = random_entries(10, 1);
    let dir = tempfile::tempdir().unwrap();
    let mut probe = || 0.0f32;
    let config = PoolConfig { threads: Some(2), monitor_cpu: false, ..PoolConfig::default() };
    let report = ThreadPool::new(config, &mut probe)
        .run(
            &mut entries,
            |worker, range| {
                Ok(Tagged {
                    spool: OutputSpool::create(dir.path(), "cap", range.start, 64)?,
                    rng: StdRng::seed_from_u64(worker as u64),
                })
            },
            None,
            &CancelToken::new(),
        )
        .unwrap();
    let before = entries.clone();
    let pass = SpoolPass::new(dir, report, 0..10, 64);
    let mut out = Vec::new();
    let err = pass.dump(&mut entries, &mut out, BASE).unwrap_err();
    assert!(matches!(err, EngineError::Capacity { limit: 64, .. }), "{err}");
    assert!(out.is_empty());
    assert_eq!(entries, before);
}
