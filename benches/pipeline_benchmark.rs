//! Benchmarks for block planning, the decode chain and a full repack pass

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use packforge::codec::Method;
use packforge::entry::{align_up, CompressionKind, Encryption, Entry, ALIGNMENT};
use packforge::pipeline::Pipeline;
use packforge::planner::{plan_blocks, BlockReader};
use packforge::workers::repack::RepackOptions;
use packforge::{Engine, EngineConfig, MemorySource};
use std::hint::black_box;
use std::io::Cursor;

/// Back-to-back entries of `size` bytes, with a gap every `gap_every` entries.
fn layout(count: usize, size: u64, gap_every: usize) -> Vec<Entry> {
    let mut offset = 16;
    (0..count)
        .map(|i| {
            if gap_every > 0 && i % gap_every == 0 {
                offset += 64;
            }
            let entry = Entry::stored(&format!("e{i}"), offset, size, size);
            offset += align_up(size, ALIGNMENT);
            entry
        })
        .collect()
}

fn benchmark_planner(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner");
    for count in [1_000usize, 50_000] {
        let entries = layout(count, 700, 97);
        group.bench_with_input(BenchmarkId::new("plan_blocks", count), &entries, |b, entries| {
            b.iter(|| black_box(plan_blocks(black_box(entries), 0, entries.len(), 8 * 1024 * 1024)));
        });
    }

    let mut entries = layout(5_000, 700, 0);
    let stream = vec![0u8; entries.last().map_or(0, |e| (e.offset + e.size_compressed_alignment) as usize)];
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("block_reader_sequential", |b| {
        b.iter(|| {
            let mut reader = BlockReader::new(1024 * 1024);
            let mut cursor = Cursor::new(&stream);
            let end = entries.len();
            for i in 0..end {
                reader.ensure(&mut cursor, &mut entries, i, end).unwrap();
            }
            black_box(reader.reads());
        });
    });
    group.finish();
}

fn benchmark_decode_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_chain");
    let pipeline = Pipeline::default();
    let plain: Vec<u8> = b"sprite act palette ".iter().cycle().take(256 * 1024).copied().collect();
    group.throughput(Throughput::Bytes(plain.len() as u64));

    for method in [Method::Lzss, Method::Zlib, Method::Lzma] {
        let encoded = pipeline.encode(&plain, method, Encryption::NONE).unwrap();
        let mut entry = Entry::stored("bench.bin", 0, encoded.size_compressed, encoded.size_decompressed);
        entry.compression = encoded.compression;
        group.bench_function(format!("primary_{method:?}").to_lowercase(), |b| {
            b.iter(|| black_box(pipeline.decode(&entry, black_box(&encoded.bytes)).unwrap()));
        });
    }

    // Zlib payload flagged as LZSS: primary fails, the chain falls through to zlib.
    let encoded = pipeline.encode(&plain, Method::Zlib, Encryption::NONE).unwrap();
    let mut entry = Entry::stored("bench.bin", 0, encoded.size_compressed, encoded.size_decompressed);
    entry.compression = CompressionKind::Lzss;
    group.bench_function("fallback_to_zlib", |b| {
        b.iter(|| black_box(pipeline.decode(&entry, black_box(&encoded.bytes)).unwrap()));
    });
    group.finish();
}

fn benchmark_repack_pass(c: &mut Criterion) {
    let pipeline = Pipeline::default();
    let mut stream = vec![0u8; 16];
    let mut entries = Vec::new();
    for i in 0..2_000 {
        let plain: Vec<u8> = format!("entry {i} ").bytes().cycle().take(4096).collect();
        let encoded = pipeline.encode(&plain, Method::Zlib, Encryption::NONE).unwrap();
        let mut entry = Entry::stored(&format!("e{i}"), stream.len() as u64, encoded.size_compressed, encoded.size_decompressed);
        entry.compression = encoded.compression;
        stream.extend_from_slice(&encoded.bytes);
        entries.push(entry);
    }
    let temp = tempfile::tempdir().unwrap();
    let config = EngineConfig { monitor_cpu: false, temp_root: Some(temp.path().to_path_buf()), ..EngineConfig::default() };
    let engine = Engine::new(MemorySource::new(stream), config).unwrap();

    let mut group = c.benchmark_group("repack");
    group.sample_size(20);
    group.bench_function("passthrough_2000_entries", |b| {
        b.iter(|| {
            let mut list = entries.clone();
            let pass = engine.repack_range(&mut list, 0..2_000, RepackOptions::default()).unwrap();
            let mut out = Vec::with_capacity(pass.data_len() as usize);
            black_box(pass.dump(&mut list, &mut out, 16).unwrap());
        });
    });
    group.finish();
}

criterion_group!(benches, benchmark_planner, benchmark_decode_chain, benchmark_repack_pass);
criterion_main!(benches);
