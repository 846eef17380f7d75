//! Port throughput benchmarks.

use audioflow::port::Port;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::thread;

const TOTAL: usize = 256 * 1024;

fn bench_ring_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_write_read");

    for frame in [320usize, 640, 2048] {
        let port = Port::ring_buffer("bench", frame * 4).unwrap();
        let input = vec![0x5Au8; frame];
        let mut output = vec![0u8; frame];

        group.throughput(Throughput::Bytes(frame as u64));
        group.bench_with_input(BenchmarkId::from_parameter(frame), &frame, |b, _| {
            b.iter(|| {
                port.write(black_box(&input), None).unwrap();
                port.read(black_box(&mut output), None).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_ring_cross_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_cross_thread");
    group.throughput(Throughput::Bytes(TOTAL as u64));

    for frame in [640usize, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(frame), &frame, |b, &frame| {
            b.iter(|| {
                let port = Port::ring_buffer("bench", 8 * 1024).unwrap();
                let writer = port.clone();
                let producer = thread::spawn(move || {
                    let chunk = vec![1u8; frame];
                    for _ in 0..TOTAL / frame {
                        writer.write(&chunk, None).unwrap();
                    }
                    writer.write_done();
                });
                let mut buf = vec![0u8; frame];
                while let Ok(n) = port.read(&mut buf, None) {
                    black_box(n);
                }
                producer.join().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_frame_pool_cross_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_pool_cross_thread");
    let frame = 640;
    group.throughput(Throughput::Bytes(TOTAL as u64));

    for nodes in [2usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, &nodes| {
            b.iter(|| {
                let port = Port::frame_pool("bench", frame, nodes).unwrap();
                let writer = port.clone();
                let producer = thread::spawn(move || {
                    let chunk = vec![1u8; frame];
                    for _ in 0..TOTAL / frame {
                        writer.write(&chunk, None).unwrap();
                    }
                    writer.write_done();
                });
                let mut buf = vec![0u8; frame];
                while let Ok(n) = port.read(&mut buf, None) {
                    black_box(n);
                }
                producer.join().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ring_single_thread,
    bench_ring_cross_thread,
    bench_frame_pool_cross_thread
);
criterion_main!(benches);
