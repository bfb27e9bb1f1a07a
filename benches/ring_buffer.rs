//! Criterion benchmarks for the shared ring buffer hot paths.
//!
//! The acquisition worker appends one record per accelerator pulse (up to
//! 100 Hz per session) while the refresh task snapshots the whole buffer
//! every refresh period. Both paths cross the same mutex, so this measures:
//! - append throughput at various record arities
//! - snapshot latency at various buffer capacities
//! - contended append while a reader snapshots in a loop
//!
//! Run with: cargo bench --bench ring_buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use photodiag::buffer::SharedRingBuffer;
use photodiag::measurement::StreamRecord;
use std::thread;

fn record(pulse_id: u64, arity: usize) -> StreamRecord {
    StreamRecord::new(pulse_id, vec![1.0; arity])
}

/// Append throughput for the record arities the panels actually use
/// (4 diodes, 6 correlation channels, a wide derived record).
fn push_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_push");

    for arity in [4usize, 6, 16] {
        let buffer: SharedRingBuffer<StreamRecord> = SharedRingBuffer::new(5000);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("arity", arity), &arity, |b, &arity| {
            let mut pulse_id = 0u64;
            b.iter(|| {
                buffer.push(black_box(record(pulse_id, arity)));
                pulse_id += 1;
            });
        });
    }

    group.finish();
}

/// Snapshot latency over full buffers of increasing capacity.
fn snapshot_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_snapshot");

    for capacity in [100usize, 1000, 5000] {
        let buffer: SharedRingBuffer<StreamRecord> = SharedRingBuffer::new(capacity);
        for i in 0..capacity {
            buffer.push(record(i as u64, 4));
        }

        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(
            BenchmarkId::new("capacity", capacity),
            &capacity,
            |b, _| {
                b.iter(|| {
                    let snapshot = buffer.snapshot();
                    black_box(snapshot.len());
                });
            },
        );
    }

    group.finish();
}

/// Append throughput while a second thread snapshots continuously,
/// approximating the worker/refresh contention pattern.
fn contended_push(c: &mut Criterion) {
    let buffer: SharedRingBuffer<StreamRecord> = SharedRingBuffer::new(1000);
    for i in 0..1000 {
        buffer.push(record(i, 4));
    }

    let reader_buffer = buffer.clone();
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reader_stop = stop.clone();
    let reader = thread::spawn(move || {
        while !reader_stop.load(std::sync::atomic::Ordering::Relaxed) {
            black_box(reader_buffer.snapshot().len());
        }
    });

    c.bench_function("ring_buffer_push_contended", |b| {
        let mut pulse_id = 0u64;
        b.iter(|| {
            buffer.push(black_box(record(pulse_id, 4)));
            pulse_id += 1;
        });
    });

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    reader.join().expect("reader thread");
}

criterion_group!(benches, push_throughput, snapshot_latency, contended_push);
criterion_main!(benches);
