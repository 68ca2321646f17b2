use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, PlotConfiguration};

extern crate buddy_cache_pool;

use buddy_cache_pool::PoolAllocator;

const TEST_ORDER: u32 = 13;

/// Allocates and immediately frees blocks of a given order, repeatedly, to
/// measure steady-state split/coalesce churn on a single thread.
fn alloc_free_churn(order: u32, iterations: usize) {
    let mut pool = PoolAllocator::new(1, TEST_ORDER);
    let size = 1usize << order;

    for _ in 0..iterations {
        let ptr = pool.allocate(size).expect("arena has room for one block");
        pool.deallocate(ptr);
    }
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let plot_config = PlotConfiguration::default();
    let mut group = c.benchmark_group("Single block alloc/free churn");

    group.plot_config(plot_config);

    for order in &[0u32, 2, 4, 6] {
        group.bench_with_input(BenchmarkId::new("alloc+free", order), order, |b, &order| {
            b.iter(|| alloc_free_churn(order, 1 << 10));
        });
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
