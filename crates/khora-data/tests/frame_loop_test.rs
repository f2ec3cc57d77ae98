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

//! Drives the allocator through whole frames on the headless device.

use khora_core::renderer::{
    BufferManagerSettings, BufferType, IndexFormat, InternalBufferType, PoolCategory,
    ResourceError, VertexAttributeDescriptor, VertexFormat,
};
use khora_data::allocators::gpu::{BufferHandle, PoolKey};
use khora_data::allocators::GpuBufferManager;
use khora_infra::HeadlessBufferDevice;
use std::collections::HashMap;
use std::sync::Arc;

const FLOAT: [VertexAttributeDescriptor; 1] =
    [VertexAttributeDescriptor::new(0, VertexFormat::Float32, 0)];
const FLOAT4: [VertexAttributeDescriptor; 1] =
    [VertexAttributeDescriptor::new(0, VertexFormat::Float32x4, 0)];

const INDEX_IMMUTABLE: PoolKey = PoolKey::new(InternalBufferType::Index, PoolCategory::Immutable);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_pools() -> BufferManagerSettings {
    let mut settings = BufferManagerSettings {
        draw_id_instance_count: 0,
        ..Default::default()
    };
    for internal in InternalBufferType::ALL {
        for category in PoolCategory::ALL {
            settings.pool_sizes.set(internal, category, 4096);
        }
    }
    settings
}

fn setup(
    device: HeadlessBufferDevice,
    settings: BufferManagerSettings,
) -> Result<(Arc<HeadlessBufferDevice>, GpuBufferManager), ResourceError> {
    let device = Arc::new(device);
    let manager = GpuBufferManager::new(device.clone(), settings)?;
    Ok((device, manager))
}

/// What the device holds for the range a draw call would bind right now.
fn bound_bytes(
    device: &HeadlessBufferDevice,
    manager: &GpuBufferManager,
    handle: BufferHandle,
) -> Vec<u8> {
    let binding = manager.current_binding(handle).unwrap();
    let contents = device.buffer_contents(binding.buffer.unwrap()).unwrap();
    contents[binding.offset as usize..(binding.offset + binding.size) as usize].to_vec()
}

#[test]
fn test_dynamic_buffer_cycles_through_ring_slices() -> Result<(), ResourceError> {
    init_logger();
    // Arrange
    let (device, mut manager) = setup(HeadlessBufferDevice::new(), small_pools())?;
    let handle = manager.create_vertex_buffer(&FLOAT4, 4, BufferType::DynamicDefault, None, false)?;
    let frames = usize::from(manager.dynamic_buffer_multiplier());

    // Act
    let mut offsets = Vec::new();
    for frame in 0..frames * 2 {
        manager.begin_frame()?;
        manager.map(handle, 0, 4)?.fill(frame as u8);
        manager.unmap(handle)?;

        offsets.push(manager.current_binding(handle)?.offset);
        assert_eq!(bound_bytes(&device, &manager, handle), vec![frame as u8; 64]);
        manager.update()?;
    }

    // Assert
    for (frame, offset) in offsets.iter().enumerate() {
        assert_eq!(*offset, offsets[frame % frames], "The ring wraps every N frames");
    }
    let mut first_lap = offsets[..frames].to_vec();
    first_lap.dedup();
    assert_eq!(first_lap.len(), frames, "Consecutive frames never share a slice");
    Ok(())
}

#[test]
fn test_mesh_batch_lives_in_one_device_buffer() -> Result<(), ResourceError> {
    init_logger();
    // Arrange
    let (device, mut manager) = setup(HeadlessBufferDevice::new(), small_pools())?;
    let meshes: Vec<(BufferHandle, Vec<u8>)> = (0..10u8)
        .map(|i| {
            let data = vec![i; 16];
            let handle = manager
                .create_index_buffer(IndexFormat::Uint16, 8, BufferType::Immutable, Some(&data), false)
                .unwrap();
            (handle, data)
        })
        .collect();
    assert_eq!(device.live_buffer_count(), 0, "Nothing reaches the device before the flush");

    // Act
    manager.begin_frame()?;

    // Assert
    assert_eq!(manager.pool_count(INDEX_IMMUTABLE), 1);
    assert_eq!(device.live_buffer_count(), 1);
    for (handle, data) in &meshes {
        assert_eq!(&bound_bytes(&device, &manager, *handle), data);
    }

    for (handle, _) in meshes {
        manager.destroy_buffer(handle)?;
    }
    assert_eq!(manager.pool_count(INDEX_IMMUTABLE), 0);
    assert_eq!(device.live_buffer_count(), 0, "The emptied pool is given back");
    Ok(())
}

#[test]
fn test_readback_completes_behind_a_lagging_gpu() -> Result<(), ResourceError> {
    init_logger();
    // Arrange
    let (_device, mut manager) = setup(HeadlessBufferDevice::new().with_latency(2), small_pools())?;
    let data: Vec<u8> = (0..16).collect();
    let handle =
        manager.create_vertex_buffer(&FLOAT, 4, BufferType::Default, Some(&data), false)?;
    let ticket = manager.create_readback_ticket(handle, 0, 4)?;

    // Act
    let mut frames_waited = 0;
    while !manager.is_ticket_ready(&ticket)? {
        manager.update()?;
        frames_waited += 1;
        assert!(frames_waited <= 4, "The ticket never became ready");
    }

    // Assert
    assert!(frames_waited >= 1, "The copy cannot be done in the frame it was issued");
    assert_eq!(manager.map_ticket(&ticket)?, data);
    manager.release_ticket(ticket)?;
    Ok(())
}

#[test]
fn test_contents_survive_a_device_reset() -> Result<(), ResourceError> {
    init_logger();
    // Arrange
    let (device, mut manager) = setup(HeadlessBufferDevice::new(), small_pools())?;
    let mesh = manager.create_vertex_buffer(&FLOAT, 8, BufferType::Immutable, Some(&[7; 32]), true)?;
    let constants = manager.create_const_buffer(64, BufferType::Default, Some(&[9; 64]), true)?;
    manager.begin_frame()?;

    // Act
    device.lose_device();
    manager.on_device_lost();
    assert_eq!(
        manager.create_const_buffer(64, BufferType::Default, None, false),
        Err(ResourceError::DeviceLost)
    );
    device.restore_device();
    manager.on_device_restored()?;

    // Assert
    assert_eq!(bound_bytes(&device, &manager, mesh), vec![7; 32]);
    assert_eq!(bound_bytes(&device, &manager, constants), vec![9; 64]);
    manager.begin_frame()?;
    manager.update()?;
    Ok(())
}

#[test]
fn test_settings_file_and_overrides_shape_the_pools() -> Result<(), ResourceError> {
    init_logger();
    // Arrange
    let mut settings = BufferManagerSettings::from_json_str(
        r#"{ "dynamic_buffer_multiplier": 2, "draw_id_instance_count": 0 }"#,
    )
    .map_err(|e| ResourceError::InvalidArgument(e.to_string()))?;
    let overrides = HashMap::from([(
        "GpuBufferManager::VERTEX_DYNAMIC".to_string(),
        "1024".to_string(),
    )]);
    settings.apply_overrides(&overrides);

    // Act
    let (_device, mut manager) = setup(HeadlessBufferDevice::new(), settings)?;
    let handle =
        manager.create_vertex_buffer(&FLOAT, 25, BufferType::DynamicDefault, None, false)?;

    // Assert
    assert_eq!(manager.dynamic_buffer_multiplier(), 2);
    assert_eq!(manager.buffer_info(handle)?.reserved_bytes, 200);
    let stats = manager.memory_stats();
    assert_eq!(stats.total_capacity_bytes, 1024);
    assert_eq!(stats.used_bytes, 200);
    Ok(())
}

#[test]
fn test_odd_sized_index_buffers_on_a_word_aligned_device() -> Result<(), ResourceError> {
    init_logger();
    // Arrange
    let (device, mut manager) = setup(HeadlessBufferDevice::new(), small_pools())?;
    let data = [1, 0, 2, 0, 3, 0];
    let triangle =
        manager.create_index_buffer(IndexFormat::Uint16, 3, BufferType::Default, Some(&data), true)?;
    let batched =
        manager.create_index_buffer(IndexFormat::Uint16, 3, BufferType::Immutable, Some(&data), false)?;

    // Act
    manager.begin_frame()?;
    manager.upload(triangle, 1, &[7, 0])?;
    let ticket = manager.create_readback_ticket(triangle, 0, 3)?;
    manager.update()?;

    // Assert
    let expected: [u8; 6] = [1, 0, 7, 0, 3, 0];
    assert_eq!(bound_bytes(&device, &manager, triangle), expected);
    assert_eq!(bound_bytes(&device, &manager, batched), data);
    assert_eq!(manager.map_ticket(&ticket)?, expected);
    manager.release_ticket(ticket)?;
    Ok(())
}
