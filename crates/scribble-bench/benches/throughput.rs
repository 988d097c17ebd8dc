//! Throughput benchmarks for Scribble.
//!
//! These benchmarks measure how fast strokes move through the engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use scribble_bench::{drain, join_peers, manager, pen, spiral_segment};
use scribble_core::{DrawEvent, EventStore, FileEventStore, MemoryEventStore};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Benchmark fan-out to boards of increasing size.
fn bench_fanout(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fanout");

    for size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let m = manager(Arc::new(MemoryEventStore::new()));
            let mut peers = rt.block_on(join_peers(&m, "bench", size + 1, 1024));
            let (writer, _) = peers.remove(0);

            b.iter_custom(|iters| {
                let start = Instant::now();
                for i in 0..iters as usize {
                    let (from, to) = spiral_segment(i);
                    let report = rt
                        .block_on(m.publish(&writer, from, to, Some(pen())))
                        .unwrap();
                    black_box(report.delivered);
                    if i % 512 == 0 {
                        for (_, rx) in &mut peers {
                            drain(rx);
                        }
                    }
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

/// Benchmark publishing to a board with nobody else on it.
fn bench_publish_alone(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("publish_alone");
    group.throughput(Throughput::Elements(1));

    group.bench_function("memory", |b| {
        let m = manager(Arc::new(MemoryEventStore::new()));
        let peers = rt.block_on(join_peers(&m, "bench", 1, 16));
        let (writer, _rx) = &peers[0];
        let mut i = 0;
        b.iter(|| {
            let (from, to) = spiral_segment(i);
            i += 1;
            rt.block_on(m.publish(writer, from, to, None)).unwrap()
        });
    });

    group.bench_function("file", |b| {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(Arc::new(FileEventStore::new(dir.path(), false)));
        let peers = rt.block_on(join_peers(&m, "bench", 1, 16));
        let (writer, _rx) = &peers[0];
        let mut i = 0;
        b.iter(|| {
            let (from, to) = spiral_segment(i);
            i += 1;
            rt.block_on(m.publish(writer, from, to, None)).unwrap()
        });
    });

    group.finish();
}

/// Benchmark raw log appends.
fn bench_store_append(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("store_append");
    group.throughput(Throughput::Elements(1));

    let (from, to) = spiral_segment(7);
    let event = DrawEvent::new("bench", from, to).with_style(Some(pen()));

    group.bench_function("memory", |b| {
        let store = MemoryEventStore::new();
        b.iter(|| rt.block_on(store.append("bench", black_box(&event))).unwrap());
    });

    group.bench_function("file", |b| {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEventStore::new(dir.path(), false);
        b.iter(|| rt.block_on(store.append("bench", black_box(&event))).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fanout,
    bench_publish_alone,
    bench_store_append,
);
criterion_main!(benches);
