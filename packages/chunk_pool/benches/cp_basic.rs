//! Basic benchmarks for the `chunk_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::{Duration, Instant};

use chunk_pool::ChunkPool;
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const ITEM_SIZE: usize = 64;
const TIMEOUT: Duration = Duration::from_secs(1);

fn created_pool(element_count: usize) -> ChunkPool {
    let pool = ChunkPool::new(ITEM_SIZE, element_count, 8);
    pool.create(TIMEOUT).unwrap();
    pool
}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("cp_basic");

    group.bench_function("create", |b| {
        b.iter_custom(|iters| {
            let pools = iter::repeat_with(|| ChunkPool::new(ITEM_SIZE, 128, 8))
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for pool in &pools {
                pool.create(TIMEOUT).unwrap();
            }

            start.elapsed()
        });
    });

    group.bench_function("allocate_free", |b| {
        let pool = created_pool(128);

        b.iter(|| {
            let block = pool.allocate(TIMEOUT).unwrap();
            pool.free(black_box(block), TIMEOUT).unwrap();
        });
    });

    // The first free chunk is found by scanning, so a mostly-used pool is the slow case.
    group.bench_function("allocate_free_last_of_1024", |b| {
        let pool = created_pool(1024);

        let _held = iter::repeat_with(|| pool.allocate(TIMEOUT).unwrap())
            .take(1023)
            .collect::<Vec<_>>();

        b.iter(|| {
            let block = pool.allocate(TIMEOUT).unwrap();
            pool.free(black_box(block), TIMEOUT).unwrap();
        });
    });

    group.bench_function("free_ptr_last_of_1024", |b| {
        let pool = created_pool(1024);

        let _held = iter::repeat_with(|| pool.allocate(TIMEOUT).unwrap())
            .take(1023)
            .collect::<Vec<_>>();

        b.iter(|| {
            let block = pool.allocate(TIMEOUT).unwrap();
            pool.free_ptr(black_box(block.ptr()), TIMEOUT).unwrap();
        });
    });

    group.bench_function("add_memory_16", |b| {
        b.iter_batched(
            || created_pool(16),
            |pool| {
                pool.add_memory(black_box(16), TIMEOUT).unwrap();
                pool
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("stats", |b| {
        let pool = created_pool(256);

        b.iter(|| black_box(pool.stats()));
    });

    group.finish();
}
