//! Memory layer benchmarks
//!
//! Measures internal allocator throughput, accounting overhead and card
//! table scans.
//!
//! Run with: `cargo bench -p otter-vm-mem`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use otter_vm_mem::{
    AllocScope, CardTable, HeapPoolManager, InternalAllocator, InternalAllocatorConfig,
    InternalAllocatorKind, MemStats, SpaceType, VisitFlags,
};
use std::hint::black_box;
use std::sync::Arc;

fn create_allocator(kind: InternalAllocatorKind) -> InternalAllocator {
    let config = InternalAllocatorConfig {
        kind,
        ..Default::default()
    };
    InternalAllocator::new(
        config,
        Arc::new(HeapPoolManager::new()),
        Arc::new(MemStats::new()),
    )
    .unwrap()
}

/// Alloc/free pairs per tier, tiered vs malloc backend
fn alloc_free_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("internal_alloc_free");

    for kind in [InternalAllocatorKind::Tiered, InternalAllocatorKind::Malloc] {
        let allocator = create_allocator(kind);
        for size in [32usize, 4096, 256 * 1024] {
            group.bench_with_input(
                BenchmarkId::new(format!("{kind:?}"), size),
                &size,
                |b, &size| {
                    b.iter(|| {
                        let ptr = allocator.alloc(size, 8, AllocScope::Global).unwrap();
                        allocator.free(black_box(ptr.as_ptr()));
                    });
                },
            );
        }
    }

    group.finish();
}

/// Batch allocation followed by batch release, small tier
fn batch_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("internal_batch");

    for count in [100usize, 1000, 10_000] {
        group.bench_with_input(BenchmarkId::new("small", count), &count, |b, &n| {
            let allocator = create_allocator(InternalAllocatorKind::Tiered);
            let mut ptrs = Vec::with_capacity(n);
            b.iter(|| {
                for _ in 0..n {
                    ptrs.push(allocator.alloc(48, 8, AllocScope::Global).unwrap());
                }
                for ptr in ptrs.drain(..) {
                    allocator.free(ptr.as_ptr());
                }
            });
        });
    }

    group.finish();
}

/// Cost of one accounting update
fn mem_stats_benchmark(c: &mut Criterion) {
    let stats = MemStats::new();
    c.bench_function("mem_stats_record_allocate", |b| {
        b.iter(|| stats.record_allocate_object(black_box(64), SpaceType::Object));
    });
    c.bench_function("mem_stats_footprint_heap", |b| {
        b.iter(|| black_box(stats.footprint_heap()));
    });
}

/// Marking and coalescing scan over a 64MB heap
fn card_table_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("card_table");
    let heap = 64 * 1024 * 1024;
    let base = 0x1000_0000;

    for stride in [1usize, 8, 64] {
        let mut table = CardTable::new(base, heap, 9).unwrap();
        table.initialize();
        group.bench_with_input(BenchmarkId::new("mark_and_visit", stride), &stride, |b, &s| {
            b.iter(|| {
                for index in (0..table.cards_count()).step_by(s) {
                    table.mark_card(base + (index << 9));
                }
                let mut ranges = 0usize;
                table.visit_marked(
                    |_| ranges += 1,
                    VisitFlags::VISIT_MARKED | VisitFlags::SET_PROCESSED,
                );
                table.clear_all();
                black_box(ranges)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    alloc_free_benchmark,
    batch_benchmark,
    mem_stats_benchmark,
    card_table_benchmark
);
criterion_main!(benches);
