//! Ring buffer throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ringbridge::ring::RingBuffer;

const CHUNK_SIZES: &[usize] = &[256, 1024, 4096];

fn bench_slice_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_slice_round_trip");
    for &chunk in CHUNK_SIZES {
        group.throughput(Throughput::Bytes(chunk as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            let (mut producer, mut consumer) =
                RingBuffer::with_capacity(1 << 16).unwrap().split();
            let data = vec![0x5Au8; chunk];
            let mut sink = vec![0u8; chunk];
            b.iter(|| {
                producer.push_slice(black_box(&data));
                consumer.pop_slice(black_box(&mut sink));
            });
        });
    }
    group.finish();
}

fn bench_region_round_trip(c: &mut Criterion) {
    // grant-style access: borrow a span, fill it, publish once
    let mut group = c.benchmark_group("ring_region_round_trip");
    for &chunk in CHUNK_SIZES {
        group.throughput(Throughput::Bytes(chunk as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            let (mut producer, mut consumer) =
                RingBuffer::with_capacity(1 << 16).unwrap().split();
            b.iter(|| {
                let mut region = producer.write_region(chunk);
                let n = region.len();
                let (head, tail) = region.slices();
                head.fill(0x11);
                tail.fill(0x11);
                region.commit(n);

                let region = consumer.read_region(chunk);
                let n = region.len();
                black_box(region.slices().0);
                region.release(n);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_slice_round_trip, bench_region_round_trip);
criterion_main!(benches);
