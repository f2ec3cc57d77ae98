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

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use wgpu::util::DeviceExt;

use khora_core::renderer::api::util::align_to_next;
use khora_core::renderer::{
    BufferDescriptor, BufferDevice, BufferDeviceLimits, BufferId, FenceId, ResourceError,
};

use super::conversions::IntoWgpu;

/// Offsets and sizes of buffer writes and copies must be multiples of this.
const COPY_ALIGNMENT: u64 = wgpu::COPY_BUFFER_ALIGNMENT;
/// Mapped ranges must start on a multiple of this.
const MAP_OFFSET_ALIGNMENT: u64 = wgpu::MAP_ALIGNMENT;

#[derive(Debug)]
pub(crate) struct WgpuBufferEntry {
    pub(crate) wgpu_buffer: Arc<wgpu::Buffer>,
    pub(crate) size: u64, // To track VRAM accurately on destruction
}

/// A [`BufferDevice`] backed by a `wgpu::Device` and its queue.
///
/// Buffers are stored in a table keyed by the opaque [`BufferId`] handed to the allocator.
/// Fences are flags raised by `Queue::on_submitted_work_done`, which fires once every
/// submission made before the fence was inserted has completed.
#[derive(Debug)]
pub struct WgpuBufferDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: BufferDeviceLimits,
    buffers: Mutex<HashMap<BufferId, WgpuBufferEntry>>,
    fences: Mutex<HashMap<FenceId, Arc<AtomicBool>>>,

    next_buffer_id: AtomicUsize,
    next_fence_id: AtomicU64,

    // VRAM Tracking
    vram_allocated_bytes: AtomicUsize,
    vram_peak_bytes: AtomicU64,
}

impl WgpuBufferDevice {
    /// Wraps an already created device and queue.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let limits = limits_from_wgpu(&device.limits());
        log::info!("WgpuBufferDevice: buffer limits {limits:?}");
        Self {
            device,
            queue,
            limits,
            buffers: Mutex::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            next_buffer_id: AtomicUsize::new(0),
            next_fence_id: AtomicU64::new(0),
            vram_allocated_bytes: AtomicUsize::new(0),
            vram_peak_bytes: AtomicU64::new(0),
        }
    }

    /// Picks the default adapter and creates a device without any surface.
    ///
    /// ## Returns
    /// * `Result<Self>` - An error when no adapter is available (e.g. on a CI machine).
    pub fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::new_without_display_handle());
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(|e| anyhow!("Failed to find a graphics adapter: {}", e))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Using graphics adapter: \"{}\" (Backend: {:?})",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Khora Buffer Device"),
            ..Default::default()
        }))
        .map_err(|e| anyhow!("Failed to create logical device: {}", e))?;

        Ok(Self::new(device, queue))
    }

    /// The wrapped wgpu device.
    pub fn wgpu_device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The wrapped wgpu queue.
    pub fn wgpu_queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Retrieves a reference-counted pointer to the internal WGPU buffer.
    /// Returns `None` if the ID is invalid.
    pub fn get_wgpu_buffer(&self, id: BufferId) -> Option<Arc<wgpu::Buffer>> {
        let buffers = self.buffers.lock().ok()?;
        buffers.get(&id).map(|entry| Arc::clone(&entry.wgpu_buffer))
    }

    /// Bytes currently held by live buffers.
    pub fn vram_allocated_bytes(&self) -> usize {
        self.vram_allocated_bytes.load(Ordering::Relaxed)
    }

    /// Highest value [`Self::vram_allocated_bytes`] ever reached.
    pub fn vram_peak_bytes(&self) -> u64 {
        self.vram_peak_bytes.load(Ordering::Relaxed)
    }

    /// Polls the underlying wgpu::Device in a blocking manner.
    /// This is primarily used during shutdown to ensure all pending operations
    /// and callbacks are completed before resources are destroyed.
    pub fn poll_device_blocking(&self) {
        if let Err(e) = self.device.poll(wgpu::PollType::wait_indefinitely()) {
            log::warn!("Failed to poll device during shutdown: {:?}", e);
        }
    }

    /// Polls the underlying wgpu::Device in a non-blocking manner.
    /// This processes completed `on_submitted_work_done` callbacks, raising fence flags.
    pub fn poll_device_non_blocking(&self) {
        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            log::warn!("Failed to poll device (non-blocking): {:?}", e);
        }
    }

    fn generate_buffer_id(&self) -> BufferId {
        BufferId(self.next_buffer_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lock_buffers(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<BufferId, WgpuBufferEntry>>, ResourceError> {
        self.buffers
            .lock()
            .map_err(|e| ResourceError::BackendError(format!("Failed to lock buffer table: {e}")))
    }

    fn lock_fences(&self) -> Result<MutexGuard<'_, HashMap<FenceId, Arc<AtomicBool>>>, ResourceError> {
        self.fences
            .lock()
            .map_err(|e| ResourceError::FenceWaitFailed(format!("Failed to lock fence table: {e}")))
    }

    fn buffer(&self, id: BufferId) -> Result<Arc<wgpu::Buffer>, ResourceError> {
        let buffers = self.lock_buffers()?;
        buffers
            .get(&id)
            .map(|entry| Arc::clone(&entry.wgpu_buffer))
            .ok_or(ResourceError::NotFound)
    }

    fn fence_flag(&self, fence: FenceId) -> Result<Arc<AtomicBool>, ResourceError> {
        self.lock_fences()?
            .get(&fence)
            .cloned()
            .ok_or_else(|| ResourceError::FenceWaitFailed(format!("unknown fence {fence:?}")))
    }

    fn check_capacity(&self, size: u64) -> Result<(), ResourceError> {
        if size > self.device.limits().max_buffer_size {
            return Err(ResourceError::OutOfDeviceMemory {
                requested_bytes: size,
            });
        }
        Ok(())
    }

    fn register(&self, wgpu_buffer: wgpu::Buffer, size: u64) -> Result<BufferId, ResourceError> {
        let id = self.generate_buffer_id();

        // Track VRAM usage
        self.vram_allocated_bytes
            .fetch_add(size as usize, Ordering::Relaxed);
        let current_vram = self.vram_allocated_bytes.load(Ordering::Relaxed) as u64;
        self.vram_peak_bytes.fetch_max(current_vram, Ordering::Relaxed);

        self.lock_buffers()?.insert(
            id,
            WgpuBufferEntry {
                wgpu_buffer: Arc::new(wgpu_buffer),
                size,
            },
        );
        Ok(id)
    }

    /// Pushes any staged `write_buffer` calls to the GPU.
    fn flush_queue(&self) {
        self.queue.submit(std::iter::empty::<wgpu::CommandBuffer>());
    }
}

/// Translates the wgpu limits into the subset the allocator cares about.
///
/// wgpu has no texel buffers, so they follow the storage buffer limits.
pub(crate) fn limits_from_wgpu(limits: &wgpu::Limits) -> BufferDeviceLimits {
    let storage_alignment = u64::from(limits.min_storage_buffer_offset_alignment);
    let storage_max = u64::from(limits.max_storage_buffer_binding_size);
    BufferDeviceLimits {
        const_buffer_alignment: u64::from(limits.min_uniform_buffer_offset_alignment),
        tex_buffer_alignment: storage_alignment,
        uav_buffer_alignment: storage_alignment,
        const_buffer_max_size: u64::from(limits.max_uniform_buffer_binding_size),
        tex_buffer_max_size: storage_max,
        uav_buffer_max_size: storage_max,
        copy_alignment: COPY_ALIGNMENT,
        supports_persistent_mapping: false,
        supports_indirect_buffers: true,
    }
}

fn check_copy_alignment(offset: u64, size: u64) -> Result<(), ResourceError> {
    if offset % COPY_ALIGNMENT != 0 || size % COPY_ALIGNMENT != 0 {
        return Err(ResourceError::InvalidArgument(format!(
            "wgpu transfers need {COPY_ALIGNMENT}-byte alignment (offset {offset}, size {size})"
        )));
    }
    Ok(())
}

impl BufferDevice for WgpuBufferDevice {
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferId, ResourceError> {
        self.check_capacity(descriptor.size)?;
        let wgpu_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: descriptor.label.as_deref(),
            size: descriptor.size,
            usage: descriptor.usage.into_wgpu(),
            mapped_at_creation: false,
        });
        let id = self.register(wgpu_buffer, descriptor.size)?;

        log::debug!(
            "WgpuBufferDevice: Created buffer '{}' with ID: {:?}, size: {} bytes",
            descriptor.label.as_deref().unwrap_or_default(),
            id,
            descriptor.size
        );
        Ok(id)
    }

    fn create_buffer_with_data(
        &self,
        descriptor: &BufferDescriptor,
        data: &[u8],
    ) -> Result<BufferId, ResourceError> {
        self.check_capacity(descriptor.size)?;
        if data.len() as u64 > descriptor.size {
            return Err(ResourceError::OutOfBounds);
        }

        // The pool is usually larger than its contents; pad the tail with zeros.
        let size = align_to_next(descriptor.size, COPY_ALIGNMENT);
        let mut contents = Vec::with_capacity(size as usize);
        contents.extend_from_slice(data);
        contents.resize(size as usize, 0);

        let wgpu_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: descriptor.label.as_deref(),
                contents: &contents,
                usage: descriptor.usage.into_wgpu(),
            });
        let id = self.register(wgpu_buffer, size)?;

        log::debug!(
            "WgpuBufferDevice: Created buffer '{}' with initial data. ID: {:?}, size: {} bytes",
            descriptor.label.as_deref().unwrap_or_default(),
            id,
            size
        );
        Ok(id)
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError> {
        let entry = self.lock_buffers()?.remove(&id).ok_or(ResourceError::NotFound)?;
        self.vram_allocated_bytes
            .fetch_sub(entry.size as usize, Ordering::Relaxed);
        // Other Arc holders (e.g. a bind group in flight) keep the object alive.
        entry.wgpu_buffer.destroy();
        log::debug!("WgpuBufferDevice: Destroyed buffer with ID: {id:?}");
        Ok(())
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ResourceError> {
        let buffer = self.buffer(id)?;

        let end_offset = offset + data.len() as u64;
        if end_offset > buffer.size() {
            return Err(ResourceError::OutOfBounds);
        }
        check_copy_alignment(offset, data.len() as u64)?;

        self.queue.write_buffer(&buffer, offset, data);
        log::trace!(
            "WgpuBufferDevice: Wrote {} bytes to buffer ID: {:?} at offset {}",
            data.len(),
            id,
            offset
        );
        Ok(())
    }

    fn copy_buffer_to_buffer(
        &self,
        source: BufferId,
        source_offset: u64,
        destination: BufferId,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), ResourceError> {
        let src = self.buffer(source)?;
        let dst = self.buffer(destination)?;
        if source_offset + size > src.size() || destination_offset + size > dst.size() {
            return Err(ResourceError::OutOfBounds);
        }
        check_copy_alignment(source_offset, size)?;
        check_copy_alignment(destination_offset, size)?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Khora Buffer Copy"),
            });
        encoder.copy_buffer_to_buffer(&src, source_offset, &dst, destination_offset, size);
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn read_buffer(&self, id: BufferId, offset: u64, size: u64) -> Result<Vec<u8>, ResourceError> {
        let buffer = self.buffer(id)?;
        if offset + size > buffer.size() {
            return Err(ResourceError::OutOfBounds);
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        // Map an aligned window around the requested range and cut it afterwards.
        let map_start = offset - offset % MAP_OFFSET_ALIGNMENT;
        let map_end = align_to_next(offset + size, COPY_ALIGNMENT).min(buffer.size());

        self.flush_queue();
        let slice = buffer.slice(map_start..map_end);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver outlives the blocking poll below.
            let _ = sender.send(result);
        });

        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| ResourceError::BackendError(format!("Failed to poll device: {e:?}")))?;
        receiver
            .recv()
            .map_err(|e| ResourceError::BackendError(format!("Map callback dropped: {e}")))?
            .map_err(|e| ResourceError::BackendError(format!("WGPU map_async failed: {e:?}")))?;

        let start = (offset - map_start) as usize;
        let bytes = slice.get_mapped_range()[start..start + size as usize].to_vec();
        buffer.unmap();
        Ok(bytes)
    }

    fn insert_fence(&self) -> Result<FenceId, ResourceError> {
        let flag = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&flag);

        self.flush_queue();
        self.queue.on_submitted_work_done(move || {
            signal.store(true, Ordering::Release);
        });

        let id = FenceId(self.next_fence_id.fetch_add(1, Ordering::Relaxed));
        self.lock_fences()?.insert(id, flag);
        Ok(id)
    }

    fn poll_fence(&self, fence: FenceId) -> Result<bool, ResourceError> {
        let flag = self.fence_flag(fence)?;
        if flag.load(Ordering::Acquire) {
            return Ok(true);
        }
        self.device
            .poll(wgpu::PollType::Poll)
            .map_err(|e| ResourceError::FenceWaitFailed(format!("{e:?}")))?;
        Ok(flag.load(Ordering::Acquire))
    }

    fn wait_fence(&self, fence: FenceId) -> Result<(), ResourceError> {
        let flag = self.fence_flag(fence)?;
        if flag.load(Ordering::Acquire) {
            return Ok(());
        }
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| ResourceError::FenceWaitFailed(format!("{e:?}")))?;

        if flag.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ResourceError::FenceWaitFailed(format!(
                "fence {fence:?} still pending after the queue drained"
            )))
        }
    }

    fn destroy_fence(&self, fence: FenceId) {
        if let Ok(mut fences) = self.fences.lock() {
            fences.remove(&fence);
        }
    }

    fn limits(&self) -> BufferDeviceLimits {
        self.limits
    }
}

impl Drop for WgpuBufferDevice {
    fn drop(&mut self) {
        // Let pending callbacks run before the buffers they reference go away.
        self.poll_device_blocking();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khora_core::renderer::BufferUsage;

    // Returns None if a suitable adapter cannot be found.
    fn create_test_device() -> Option<WgpuBufferDevice> {
        WgpuBufferDevice::new_headless().ok()
    }

    #[test]
    fn limits_follow_wgpu_defaults() {
        let limits = limits_from_wgpu(&wgpu::Limits::default());
        assert_eq!(limits.const_buffer_alignment, 256);
        assert_eq!(limits.uav_buffer_alignment, 256);
        assert_eq!(limits.tex_buffer_alignment, limits.uav_buffer_alignment);
        assert_eq!(limits.const_buffer_max_size, 64 << 10);
        assert_eq!(limits.uav_buffer_max_size, 128 << 20);
        assert_eq!(limits.copy_alignment, 4, "Writes and copies move whole words");
        assert!(!limits.supports_persistent_mapping);
    }

    #[test]
    fn unaligned_transfers_are_rejected() {
        assert!(check_copy_alignment(0, 16).is_ok());
        assert!(matches!(
            check_copy_alignment(2, 16),
            Err(ResourceError::InvalidArgument(_))
        ));
        assert!(matches!(
            check_copy_alignment(0, 6),
            Err(ResourceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn buffer_round_trip_or_skips() {
        // This test requires a physical device, so it might be skipped on CI without one.
        let Some(device) = create_test_device() else {
            println!("Skipping wgpu buffer test: could not create test device.");
            return;
        };

        let data: Vec<u8> = (0..64).collect();
        let source = device
            .create_buffer_with_data(
                &BufferDescriptor::new("source", 64, BufferUsage::VERTEX | BufferUsage::COPY_SRC),
                &data,
            )
            .unwrap();
        let readback = device
            .create_buffer(&BufferDescriptor::new(
                "readback",
                64,
                BufferUsage::MAP_READ | BufferUsage::COPY_DST,
            ))
            .unwrap();

        device
            .copy_buffer_to_buffer(source, 16, readback, 0, 32)
            .unwrap();
        let bytes = device.read_buffer(readback, 4, 6).unwrap();
        assert_eq!(bytes, (20..26).collect::<Vec<u8>>());

        assert_eq!(device.vram_allocated_bytes(), 128);
        device.destroy_buffer(source).unwrap();
        assert_eq!(device.vram_allocated_bytes(), 64);
        assert_eq!(device.destroy_buffer(source), Err(ResourceError::NotFound));
    }

    #[test]
    fn fences_signal_after_wait_or_skips() {
        let Some(device) = create_test_device() else {
            println!("Skipping wgpu fence test: could not create test device.");
            return;
        };

        let fence = device.insert_fence().unwrap();
        device.wait_fence(fence).unwrap();
        assert!(device.poll_fence(fence).unwrap());

        device.destroy_fence(fence);
        assert!(matches!(
            device.poll_fence(fence),
            Err(ResourceError::FenceWaitFailed(_))
        ));
    }
}
