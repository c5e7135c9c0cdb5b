//! Run with:
//!   cargo bench --bench sync_benchmark

use criterion::{
    BenchmarkId, Criterion, black_box, criterion_group, criterion_main,
};
use gc_sync::{
    ArrayTaskDispatcher, MutatorRegistry, ObjectHeader, ObjectSpace, TaskPool,
};

fn bench_object_lock(c: &mut Criterion) {
    let object = ObjectHeader::new();
    c.bench_function("object_lock_uncontended", |b| {
        b.iter(|| {
            let lock = black_box(&object).lock();
            black_box(lock.forward_state());
        })
    });

    c.bench_function("read_barrier_normal", |b| {
        b.iter(|| black_box(black_box(&object).read_barrier()))
    });
}

fn bench_safepoint(c: &mut Criterion) {
    let registry = MutatorRegistry::new();
    let mutator = registry.register();
    mutator.start();
    c.bench_function("safepoint_fast_path", |b| {
        b.iter(|| black_box(&mutator).safepoint())
    });

    c.bench_function("suspend_all_idle", |b| {
        b.iter(|| {
            let _native = mutator.enter_native();
            let scope = registry.suspend_all(None);
            black_box(scope.participants().len());
        })
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let pool = TaskPool::new(4);
    let mut group = c.benchmark_group("dispatch_1mb");
    for threads in [1usize, 2, 4] {
        let id = BenchmarkId::from_parameter(threads);
        group.bench_with_input(id, &threads, |b, &n| {
            b.iter(|| {
                let consumer = |range: std::ops::Range<usize>| {
                    black_box(range.len());
                };
                let dispatcher = ArrayTaskDispatcher::new(
                    0x10_0000, 1 << 20, 32_768, consumer,
                );
                dispatcher.dispatch(&pool, n);
                dispatcher.join_and_wait();
            })
        });
    }
    group.finish();

    let space = ObjectSpace::new(65_536);
    c.bench_function("evacuate_64k_objects", |b| {
        b.iter(|| {
            space.forward(&pool, 4, 32_768, 0x1000_0000_0000);
            space.retire(&pool, 4, 32_768);
        })
    });
}

criterion_group!(benches, bench_object_lock, bench_safepoint, bench_dispatch);
criterion_main!(benches);
