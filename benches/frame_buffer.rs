//! Criterion benchmarks for the frame buffer hot paths.
//!
//! The capture thread pushes on every device read, so push under contention with a
//! polling consumer is the number that matters.
//!
//! Run with: cargo bench --bench frame_buffer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use xicam::capture::{Frame, Metadata};
use xicam::pipeline::FrameBuffer;

fn frame(i: u64) -> Frame {
    Frame::new(
        Bytes::from_static(&[0u8; 64]),
        Metadata {
            frame_id: i,
            timestamp: i as f64,
            ..Metadata::default()
        },
    )
}

fn push_overwrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_buffer_push");

    for capacity in [1usize, 4, 10, 64] {
        let buffer = FrameBuffer::new(capacity).unwrap();
        let mut i = 0u64;
        group.bench_with_input(BenchmarkId::new("full", capacity), &capacity, |b, _| {
            b.iter(|| {
                i += 1;
                buffer.push(black_box(frame(i)));
            });
        });
    }

    group.finish();
}

fn push_pop(c: &mut Criterion) {
    let buffer = FrameBuffer::new(10).unwrap();
    let mut i = 0u64;
    c.bench_function("frame_buffer_push_pop", |b| {
        b.iter(|| {
            i += 1;
            buffer.push(frame(i));
            black_box(buffer.pop_oldest());
        });
    });
}

fn push_with_polling_consumer(c: &mut Criterion) {
    let buffer = Arc::new(FrameBuffer::new(4).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let consumer = {
        let buffer = Arc::clone(&buffer);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                black_box(buffer.pop_oldest());
            }
        })
    };

    let mut i = 0u64;
    c.bench_function("frame_buffer_push_contended", |b| {
        b.iter(|| {
            i += 1;
            buffer.push(frame(i));
        });
    });

    stop.store(true, Ordering::Relaxed);
    consumer.join().unwrap();
}

criterion_group!(benches, push_overwrite, push_pop, push_with_polling_consumer);
criterion_main!(benches);
