//! Benchmark: radix array fills, point reads, and range locks.

use criterion::{criterion_group, criterion_main, Criterion};
use quiesce::{Domain, RadixArray};
use std::hint::black_box;
use std::time::Duration;

const LEAF: usize = RadixArray::<u64>::LEAF_FANOUT;

fn bench_compressed_fill(c: &mut Criterion) {
    let domain = Domain::builder().cores(1).workers(false).build();
    let arr = RadixArray::<u64>::new(&domain, 64 * LEAF);
    let handle = domain.register();
    c.bench_function("radix_fill_aligned_64_leaves", |b| {
        b.iter(|| {
            let guard = handle.pin();
            arr.fill(0, 64 * LEAF, black_box(9), &guard).unwrap();
        });
    });
}

fn bench_element_fill(c: &mut Criterion) {
    let domain = Domain::builder().cores(1).workers(false).build();
    let arr = RadixArray::<u64>::new(&domain, 64 * LEAF);
    let handle = domain.register();
    c.bench_function("radix_fill_unaligned_half_leaf", |b| {
        b.iter(|| {
            let guard = handle.pin();
            arr.fill(1, LEAF / 2, black_box(3), &guard).unwrap();
        });
    });
}

fn bench_point_reads(c: &mut Criterion) {
    let domain = Domain::builder().cores(1).workers(false).build();
    let arr = RadixArray::<u64>::new(&domain, 64 * LEAF);
    let handle = domain.register();
    let guard = handle.pin();
    arr.fill(0, 64 * LEAF, 5, &guard).unwrap();
    arr.fill(LEAF + 1, 2 * LEAF + 1, 8, &guard).unwrap();
    c.bench_function("radix_get_mixed_tree", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            idx = (idx + 7) % (64 * LEAF);
            black_box(arr.get(black_box(idx), &guard));
        });
    });
}

fn bench_runs_scan(c: &mut Criterion) {
    let domain = Domain::builder().cores(1).workers(false).build();
    let arr = RadixArray::<u64>::new(&domain, 64 * LEAF);
    let handle = domain.register();
    let guard = handle.pin();
    for i in 0..32 {
        arr.fill(2 * i * LEAF, (2 * i + 1) * LEAF, 7, &guard).unwrap();
    }
    c.bench_function("radix_runs_scan_64_leaves", |b| {
        b.iter(|| {
            let mut spans = 0usize;
            for run in arr.runs(0, 64 * LEAF, &guard) {
                spans += black_box(run.span());
            }
            black_box(spans)
        });
    });
}

fn bench_range_lock(c: &mut Criterion) {
    let domain = Domain::builder().cores(1).workers(false).build();
    let arr = RadixArray::<u64>::new(&domain, 64 * LEAF);
    let handle = domain.register();
    let guard = handle.pin();
    arr.fill(0, 64 * LEAF, 5, &guard).unwrap();
    drop(guard);
    c.bench_function("radix_lock_one_leaf", |b| {
        b.iter(|| {
            let guard = handle.pin();
            let lock = arr.acquire(0, LEAF, &guard).unwrap();
            black_box(&lock);
        });
    });
}

criterion_group!(
    name = radix_fill;
    config = Criterion::default()
        .sample_size(30)
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_secs(2));
    targets =
        bench_compressed_fill,
        bench_element_fill,
        bench_point_reads,
        bench_runs_scan,
        bench_range_lock,
);

criterion_main!(radix_fill);
