use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use khora_core::renderer::{
    BufferDescriptor, BufferDevice, BufferDeviceLimits, BufferId, BufferManagerSettings,
    BufferType, FenceId, ResourceError, VertexAttributeDescriptor, VertexFormat,
};
use khora_data::allocators::GpuBufferManager;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A device that only hands out ids, so the allocator's own cost is measured.
#[derive(Debug, Default)]
struct NullDevice {
    next_buffer: AtomicUsize,
    next_fence: AtomicU64,
}

impl BufferDevice for NullDevice {
    fn create_buffer(&self, _descriptor: &BufferDescriptor) -> Result<BufferId, ResourceError> {
        Ok(BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed)))
    }

    fn create_buffer_with_data(
        &self,
        descriptor: &BufferDescriptor,
        _data: &[u8],
    ) -> Result<BufferId, ResourceError> {
        self.create_buffer(descriptor)
    }

    fn destroy_buffer(&self, _id: BufferId) -> Result<(), ResourceError> {
        Ok(())
    }

    fn write_buffer(&self, _id: BufferId, _offset: u64, _data: &[u8]) -> Result<(), ResourceError> {
        Ok(())
    }

    fn copy_buffer_to_buffer(
        &self,
        _source: BufferId,
        _source_offset: u64,
        _destination: BufferId,
        _destination_offset: u64,
        _size: u64,
    ) -> Result<(), ResourceError> {
        Ok(())
    }

    fn read_buffer(&self, _id: BufferId, _offset: u64, size: u64) -> Result<Vec<u8>, ResourceError> {
        Ok(vec![0; size as usize])
    }

    fn insert_fence(&self) -> Result<FenceId, ResourceError> {
        Ok(FenceId(self.next_fence.fetch_add(1, Ordering::Relaxed)))
    }

    fn poll_fence(&self, _fence: FenceId) -> Result<bool, ResourceError> {
        Ok(true)
    }

    fn wait_fence(&self, _fence: FenceId) -> Result<(), ResourceError> {
        Ok(())
    }

    fn destroy_fence(&self, _fence: FenceId) {}

    fn limits(&self) -> BufferDeviceLimits {
        BufferDeviceLimits::default()
    }
}

const LAYOUT: [VertexAttributeDescriptor; 2] = [
    VertexAttributeDescriptor::new(0, VertexFormat::Float32x3, 0),
    VertexAttributeDescriptor::new(1, VertexFormat::Float32x2, 12),
];

fn new_manager() -> GpuBufferManager {
    let settings = BufferManagerSettings {
        draw_id_instance_count: 0,
        ..Default::default()
    };
    match GpuBufferManager::new(Arc::new(NullDevice::default()), settings) {
        Ok(manager) => manager,
        Err(e) => panic!("Failed to create the buffer manager: {e}"),
    }
}

fn bench_pools(c: &mut Criterion) {
    let mut group = c.benchmark_group("GPU Buffer Pools");

    group.bench_function("Default alloc/free churn (1,000 buffers)", |b| {
        let mut manager = new_manager();
        b.iter(|| {
            let handles: Vec<_> = (0..1_000u64)
                .map(|i| {
                    manager
                        .create_vertex_buffer(&LAYOUT, 16 + (i * 37) % 512, BufferType::Default, None, false)
                        .unwrap()
                })
                .collect();
            // Free every other buffer first to fragment the pools, then the rest.
            let (even, odd): (Vec<_>, Vec<_>) =
                handles.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
            for (_, handle) in even {
                manager.destroy_buffer(handle).unwrap();
            }
            black_box(manager.memory_stats().free_bytes);
            for (_, handle) in odd {
                manager.destroy_buffer(handle).unwrap();
            }
            manager.cleanup_empty_pools();
        });
    });

    group.bench_function("Immutable batch flush (1,000 buffers)", |b| {
        let data = vec![0u8; 20 * 256];
        b.iter_batched(
            || {
                let mut manager = new_manager();
                for i in 0..1_000u64 {
                    let vertices = 16 + i % 240;
                    manager
                        .create_vertex_buffer(
                            &LAYOUT,
                            vertices,
                            BufferType::Immutable,
                            Some(&data[..(vertices * 20) as usize]),
                            false,
                        )
                        .unwrap();
                }
                manager
            },
            |mut manager| {
                manager.flush_pending().unwrap();
                black_box(manager.pending_immutable_count());
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_pools);
criterion_main!(benches);
