//! Benchmarks for state history components.
//!
//! Run with: cargo bench --package alopex-statehist
//!
//! ## Benchmark Categories
//!
//! - **Build**: state changes turned into a sealed history file
//! - **Point Queries**: single attribute and full state at one time
//! - **Range Queries**: history of one attribute over a time range

use alopex_statehist::{HistoryTreeConfig, Quark, StateSystem, StateSystemBuilder};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const THREADS: usize = 16;

/// Simulates a scheduler trace: every tick one thread changes status.
fn build(path: &Path, changes: usize) -> (Arc<StateSystem>, Vec<Quark>) {
    let mut builder =
        StateSystemBuilder::create(path, "bench", 0, HistoryTreeConfig::default()).unwrap();
    let quarks: Vec<_> = (0..THREADS)
        .map(|tid| builder.get_or_create_quark(&["Threads", tid.to_string().as_str(), "Status"]))
        .collect();
    for i in 0..changes {
        let status = if i % 3 == 0 { "RUN" } else { "WAIT" };
        builder
            .modify_attribute(i as i64 * 10, quarks[i % THREADS], status)
            .unwrap();
    }
    let ss = builder.close_history(changes as i64 * 10).unwrap();
    (ss, quarks)
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("history_build");
    group.sample_size(10);

    for size in [10_000usize, 100_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let temp_dir = TempDir::new().unwrap();
                build(&temp_dir.path().join("bench.ht"), black_box(size))
            });
        });
    }

    group.finish();
}

fn bench_point_query(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let changes = 100_000usize;
    let (ss, quarks) = build(&temp_dir.path().join("bench.ht"), changes);
    let end = changes as i64 * 10;

    let mut group = c.benchmark_group("history_point_query");

    group.bench_function("single_state", |b| {
        let mut t = 0i64;
        b.iter(|| {
            t = (t + 7_919) % end;
            ss.query_single_state(black_box(t), quarks[(t as usize) % THREADS])
                .unwrap()
        });
    });

    group.bench_function("full_state", |b| {
        let mut t = 0i64;
        b.iter(|| {
            t = (t + 7_919) % end;
            ss.query_full_state(black_box(t)).unwrap()
        });
    });

    group.finish();
}

fn bench_range_query(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let changes = 100_000usize;
    let (ss, quarks) = build(&temp_dir.path().join("bench.ht"), changes);
    let end = changes as i64 * 10;

    let mut group = c.benchmark_group("history_range_query");

    group.bench_function("full_history", |b| {
        b.iter(|| ss.query_history_range(quarks[0], 0, black_box(end)).unwrap())
    });

    group.bench_function("one_percent", |b| {
        let window = end / 100;
        b.iter(|| {
            ss.query_history_range(quarks[3], black_box(end / 2), end / 2 + window)
                .unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_build, bench_point_query, bench_range_query);
criterion_main!(benches);
