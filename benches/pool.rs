//! Benchmarks for framegpu.
//!
//! Run with: cargo bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::Mat4;

use framegpu::{
    AllocUsage, BufferFactory, BufferHandle, DrawInstance, DummyDevice, MeshRef, PoolAllocator,
    PoolConfig, PublishStrategy, RenderDevice, RendererConfig, UniformArena,
};
use framegpu::device::traits::CommandHandle;
use framegpu::memory::DeviceAllocator;

fn bench_pool_churn(c: &mut Criterion) {
    let device: Arc<dyn RenderDevice> = Arc::new(DummyDevice::new());

    let mut group = c.benchmark_group("pool");

    group.bench_function("alloc_release_4kb", |b| {
        let mut pool = PoolAllocator::new(device.clone(), PoolConfig::default());
        b.iter(|| {
            let allocation = pool.allocate(1, 4096, AllocUsage::Linear).unwrap();
            black_box(allocation.offset());
            pool.release(allocation);
        })
    });

    group.bench_function("alloc_release_mixed_64x", |b| {
        let mut pool = PoolAllocator::new(device.clone(), PoolConfig::default());
        b.iter(|| {
            let mut live = Vec::with_capacity(64);
            for i in 0..64u64 {
                let size = 256 + (i % 7) * 1500;
                live.push(pool.allocate(1, size, AllocUsage::Linear).unwrap());
            }
            // Release odd indices first to exercise span merging.
            let mut index = live.len();
            while index > 0 {
                index -= 1;
                if index % 2 == 1 {
                    pool.release(live.remove(index));
                }
            }
            for allocation in live.drain(..) {
                pool.release(allocation);
            }
        })
    });

    group.finish();
}

fn bench_arena_publish(c: &mut Criterion) {
    let device: Arc<dyn RenderDevice> = Arc::new(DummyDevice::new());
    let config = RendererConfig::default()
        .with_page_capacity(256)
        .with_publish(PublishStrategy::Mapped);

    let factory = BufferFactory::new(device.clone());
    let mut allocator = PoolAllocator::new(device.clone(), PoolConfig::default());
    let mut arena = UniformArena::new(device, &config);

    let draws: Vec<DrawInstance> = (0..256)
        .map(|entity| {
            let (slot, _) = arena.acquire(&factory, &mut allocator).unwrap();
            DrawInstance {
                entity,
                slot,
                mesh: MeshRef {
                    vertex: BufferHandle(0),
                    index: BufferHandle(0),
                    index_count: 36,
                },
                transform: Mat4::from_rotation_y(entity as f32),
            }
        })
        .collect();

    c.bench_function("arena_publish_256_mapped", |b| {
        b.iter(|| {
            arena.publish(black_box(&draws), CommandHandle(0)).unwrap();
        })
    });

    for draw in &draws {
        arena.release(draw.slot);
    }
    arena.destroy(&factory, &mut allocator);
}

criterion_group!(benches, bench_pool_churn, bench_arena_publish);
criterion_main!(benches);
