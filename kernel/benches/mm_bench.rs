//! Benchmarks for the memory subsystem
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use musim_kernel::mm::FramePool;
use musim_kernel::*;

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");

    group.bench_function("allocate_free", |b| {
        let mut alloc = FrameAllocator::new(4096, 256);
        b.iter(|| {
            let frame = alloc.allocate().unwrap();
            alloc.free(black_box(frame));
        })
    });

    group.bench_function("allocate_half_full", |b| {
        let mut alloc = FrameAllocator::new(4096, 256);
        for _ in 0..1920 {
            alloc.allocate().unwrap();
        }
        b.iter(|| {
            let frame = alloc.allocate().unwrap();
            alloc.free(black_box(frame));
        })
    });

    group.finish();
}

fn populated_space(frames: &FramePool, pages: usize) -> AddressSpace {
    let mut space = AddressSpace::new(frames.clone());
    space.expand_brk((pages * PAGE_SIZE) as u64);
    space
}

fn bench_fork(c: &mut Criterion) {
    let mut group = c.benchmark_group("fork");

    for pages in [16, 256, 1024] {
        let frames = FramePool::new(FrameAllocator::new(4096, 0));
        let mut parent = populated_space(&frames, pages);

        group.throughput(Throughput::Elements(pages as u64));
        group.bench_function(format!("fork_{}_pages", pages), |b| {
            b.iter(|| black_box(parent.fork().unwrap()))
        });
    }

    group.finish();
}

fn bench_cow_write(c: &mut Criterion) {
    let frames = FramePool::new(FrameAllocator::new(4096, 0));
    let mut parent = populated_space(&frames, 64);

    let mut group = c.benchmark_group("cow");
    group.throughput(Throughput::Bytes(PAGE_SIZE as u64));

    group.bench_function("write_shared_page", |b| {
        b.iter_batched(
            || parent.fork().unwrap(),
            |mut child| child.write_byte(black_box(VirtAddr::new(0)), 1).unwrap(),
            BatchSize::SmallInput,
        )
    });

    group.bench_function("write_private_page", |b| {
        let mut space = populated_space(&frames, 1);
        b.iter(|| space.write_byte(black_box(VirtAddr::new(8)), 1).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_frames, bench_fork, bench_cow_write);
criterion_main!(benches);
