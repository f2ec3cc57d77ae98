// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Checks every backend against the same `BufferDevice` contract.
//!
//! The wgpu half needs an adapter and is skipped on machines without one.

use khora_core::renderer::{
    BufferDescriptor, BufferDevice, BufferManagerSettings, BufferType, BufferUsage,
    InternalBufferType, PoolCategory, ResourceError, VertexAttributeDescriptor, VertexFormat,
};
use khora_data::allocators::GpuBufferManager;
use khora_infra::HeadlessBufferDevice;
use std::sync::Arc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Sizes and offsets stay multiples of 8 so every backend accepts them.
fn exercise_contract(device: &dyn BufferDevice) -> Result<(), ResourceError> {
    let data: Vec<u8> = (0..32).collect();
    let source = device.create_buffer_with_data(
        &BufferDescriptor::new("contract source", 32, BufferUsage::VERTEX | BufferUsage::COPY_SRC),
        &data,
    )?;
    let target = device.create_buffer(&BufferDescriptor::new(
        "contract target",
        64,
        BufferUsage::MAP_READ | BufferUsage::COPY_DST,
    ))?;

    device.copy_buffer_to_buffer(source, 8, target, 16, 16)?;
    assert_eq!(device.read_buffer(target, 16, 16)?, data[8..24].to_vec());
    assert_eq!(device.read_buffer(target, 0, 8)?, vec![0; 8], "Untouched bytes stay zeroed");

    assert_eq!(
        device.read_buffer(target, 56, 16),
        Err(ResourceError::OutOfBounds)
    );

    let fence = device.insert_fence()?;
    device.wait_fence(fence)?;
    assert!(device.poll_fence(fence)?, "A waited fence is signaled");
    device.destroy_fence(fence);

    device.destroy_buffer(source)?;
    device.destroy_buffer(target)?;
    assert_eq!(device.destroy_buffer(target), Err(ResourceError::NotFound));

    let limits = device.limits();
    assert!(limits.const_buffer_alignment > 0);
    assert!(limits.const_buffer_max_size > 0);
    Ok(())
}

fn small_pools() -> BufferManagerSettings {
    let mut settings = BufferManagerSettings {
        draw_id_instance_count: 64,
        min_staging_buffer_size: 4096,
        ..Default::default()
    };
    for internal in InternalBufferType::ALL {
        for category in PoolCategory::ALL {
            settings.pool_sizes.set(internal, category, 64 * 1024);
        }
    }
    settings
}

/// A few frames of typical allocator traffic, checked through a readback.
fn run_frames(device: Arc<dyn BufferDevice>) -> Result<(), ResourceError> {
    const POSITION: [VertexAttributeDescriptor; 1] =
        [VertexAttributeDescriptor::new(0, VertexFormat::Float32x4, 0)];

    let mut manager = GpuBufferManager::new(device, small_pools())?;
    let mesh: Vec<u8> = (0..64).collect();
    let static_mesh =
        manager.create_vertex_buffer(&POSITION, 4, BufferType::Immutable, Some(&mesh), false)?;
    let per_frame =
        manager.create_vertex_buffer(&POSITION, 4, BufferType::DynamicDefault, None, false)?;

    for frame in 0..5u8 {
        manager.begin_frame()?;
        manager.map(per_frame, 0, 4)?.fill(frame);
        manager.unmap(per_frame)?;
        manager.update()?;
    }

    let ticket = manager.create_readback_ticket(static_mesh, 0, 4)?;
    assert_eq!(manager.map_ticket(&ticket)?, mesh);
    manager.release_ticket(ticket)?;

    let ticket = manager.create_readback_ticket(per_frame, 0, 4)?;
    assert_eq!(manager.map_ticket(&ticket)?, vec![4; 64]);
    manager.release_ticket(ticket)?;

    manager.destroy_buffer(per_frame)?;
    manager.destroy_buffer(static_mesh)?;
    Ok(())
}

#[test]
fn test_headless_device_honours_the_contract() -> Result<(), ResourceError> {
    init_logger();
    exercise_contract(&HeadlessBufferDevice::new())
}

#[test]
fn test_headless_device_runs_the_allocator() -> Result<(), ResourceError> {
    init_logger();
    run_frames(Arc::new(HeadlessBufferDevice::new().with_latency(1)))
}

#[cfg(feature = "graphics")]
mod wgpu_backend {
    use super::*;
    use khora_infra::WgpuBufferDevice;

    // Returns None if a suitable adapter cannot be found.
    fn create_test_device() -> Option<WgpuBufferDevice> {
        WgpuBufferDevice::new_headless().ok()
    }

    #[test]
    fn test_wgpu_device_honours_the_contract_or_skips() -> Result<(), ResourceError> {
        init_logger();
        let Some(device) = create_test_device() else {
            println!("Skipping wgpu contract test: could not create test device.");
            return Ok(());
        };
        exercise_contract(&device)
    }

    #[test]
    fn test_wgpu_device_runs_the_allocator_or_skips() -> Result<(), ResourceError> {
        init_logger();
        let Some(device) = create_test_device() else {
            println!("Skipping wgpu allocator test: could not create test device.");
            return Ok(());
        };
        run_frames(Arc::new(device))
    }
}
