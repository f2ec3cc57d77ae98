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

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use khora_core::renderer::{
    BufferDescriptor, BufferDevice, BufferDeviceLimits, BufferId, BufferUsage, FenceId,
    ResourceError,
};

/// Counters describing how a [`HeadlessBufferDevice`] has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    /// Buffers created over the device's lifetime.
    pub buffers_created: usize,
    /// Buffers destroyed over the device's lifetime.
    pub buffers_destroyed: usize,
    /// Fences inserted over the device's lifetime.
    pub fences_inserted: usize,
    /// Non-blocking fence checks.
    pub fence_polls: usize,
    /// Blocking fence waits that actually had to stall.
    pub fence_stalls: usize,
}

#[derive(Debug)]
struct HeadlessBuffer {
    data: Vec<u8>,
    usage: BufferUsage,
}

#[derive(Debug, Default)]
struct HeadlessState {
    buffers: HashMap<BufferId, HeadlessBuffer>,
    next_buffer_id: usize,
    live_fences: HashSet<u64>,
    /// Fence IDs start at 1; a fence is signaled once its ID is at most this value.
    last_fence: u64,
    completed_through: u64,
    allocated_bytes: u64,
    peak_bytes: u64,
    budget: Option<u64>,
    lost: bool,
    stats: HeadlessStats,
}

impl HeadlessState {
    fn ensure_alive(&self) -> Result<(), ResourceError> {
        if self.lost {
            return Err(ResourceError::DeviceLost);
        }
        Ok(())
    }

    fn buffer(&self, id: BufferId) -> Result<&HeadlessBuffer, ResourceError> {
        self.buffers.get(&id).ok_or(ResourceError::NotFound)
    }

    fn insert(
        &mut self,
        descriptor: &BufferDescriptor,
        data: Vec<u8>,
    ) -> Result<BufferId, ResourceError> {
        self.ensure_alive()?;
        if let Some(budget) = self.budget {
            if self.allocated_bytes + descriptor.size > budget {
                return Err(ResourceError::OutOfDeviceMemory {
                    requested_bytes: descriptor.size,
                });
            }
        }

        let id = BufferId(self.next_buffer_id);
        self.next_buffer_id += 1;
        self.allocated_bytes += descriptor.size;
        self.peak_bytes = self.peak_bytes.max(self.allocated_bytes);
        self.stats.buffers_created += 1;
        self.buffers.insert(
            id,
            HeadlessBuffer {
                data,
                usage: descriptor.usage,
            },
        );

        log::trace!(
            "HeadlessBufferDevice: Created buffer '{}' with ID: {:?}, size: {} bytes",
            descriptor.label.as_deref().unwrap_or_default(),
            id,
            descriptor.size
        );
        Ok(id)
    }
}

/// A [`BufferDevice`] that keeps buffer contents in host memory.
///
/// The simulated GPU runs `latency` fences behind the CPU: a fence becomes signaled once
/// `latency` newer fences have been inserted after it, when it is waited on, or when
/// [`HeadlessBufferDevice::finish_all`] is called. A latency of zero signals every fence
/// as soon as it is inserted.
#[derive(Debug)]
pub struct HeadlessBufferDevice {
    limits: BufferDeviceLimits,
    latency: u64,
    state: Mutex<HeadlessState>,
}

impl Default for HeadlessBufferDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBufferDevice {
    /// Creates a device with the default limits and a latency of two frames.
    pub fn new() -> Self {
        Self {
            limits: BufferDeviceLimits::default(),
            latency: 2,
            state: Mutex::new(HeadlessState::default()),
        }
    }

    /// Replaces the limits reported to the allocator.
    pub fn with_limits(mut self, limits: BufferDeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets how many fences the simulated GPU lags behind.
    pub fn with_latency(mut self, latency: u64) -> Self {
        self.latency = latency;
        self
    }

    /// Makes buffer creation fail once `bytes` of buffers are alive.
    pub fn with_budget(self, bytes: u64) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.budget = Some(bytes);
        }
        self
    }

    /// Rejects transfers that the configured copy alignment would reject on real hardware.
    fn check_copy_alignment(&self, offset: u64, size: u64) -> Result<(), ResourceError> {
        let alignment = self.limits.copy_alignment.max(1);
        if offset % alignment != 0 || size % alignment != 0 {
            return Err(ResourceError::InvalidArgument(format!(
                "transfers need {alignment}-byte alignment (offset {offset}, size {size})"
            )));
        }
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, HeadlessState>, ResourceError> {
        self.state.lock().map_err(|e| {
            ResourceError::BackendError(format!("Headless device state poisoned: {e}"))
        })
    }

    /// Signals every fence inserted so far.
    pub fn finish_all(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.completed_through = state.last_fence;
        }
    }

    /// Simulates a device removal: every buffer and fence disappears and further
    /// operations report [`ResourceError::DeviceLost`] until [`Self::restore_device`].
    pub fn lose_device(&self) {
        if let Ok(mut state) = self.state.lock() {
            log::warn!(
                "HeadlessBufferDevice: Device lost with {} live buffers",
                state.buffers.len()
            );
            state.lost = true;
            state.buffers.clear();
            state.live_fences.clear();
            state.allocated_bytes = 0;
            state.completed_through = state.last_fence;
        }
    }

    /// Makes the device usable again after [`Self::lose_device`].
    pub fn restore_device(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.lost = false;
        }
    }

    /// Whether the device is currently lost.
    pub fn is_lost(&self) -> bool {
        self.state.lock().map(|s| s.lost).unwrap_or(true)
    }

    /// Number of buffers currently alive.
    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().map(|s| s.buffers.len()).unwrap_or(0)
    }

    /// Bytes held by live buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().map(|s| s.allocated_bytes).unwrap_or(0)
    }

    /// Highest value [`Self::allocated_bytes`] ever reached.
    pub fn peak_bytes(&self) -> u64 {
        self.state.lock().map(|s| s.peak_bytes).unwrap_or(0)
    }

    /// Usage counters.
    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().map(|s| s.stats).unwrap_or_default()
    }

    /// A copy of a buffer's bytes, whatever its usage flags.
    pub fn buffer_contents(&self, id: BufferId) -> Option<Vec<u8>> {
        let state = self.state.lock().ok()?;
        state.buffers.get(&id).map(|b| b.data.clone())
    }

    /// Size and usage of a live buffer.
    pub fn buffer_info(&self, id: BufferId) -> Option<(u64, BufferUsage)> {
        let state = self.state.lock().ok()?;
        state
            .buffers
            .get(&id)
            .map(|b| (b.data.len() as u64, b.usage))
    }
}

fn byte_range(offset: u64, size: u64, len: usize) -> Result<std::ops::Range<usize>, ResourceError> {
    let start = offset as usize;
    let end = start + size as usize;
    if end > len {
        return Err(ResourceError::OutOfBounds);
    }
    Ok(start..end)
}

impl BufferDevice for HeadlessBufferDevice {
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferId, ResourceError> {
        self.state()?
            .insert(descriptor, vec![0; descriptor.size as usize])
    }

    fn create_buffer_with_data(
        &self,
        descriptor: &BufferDescriptor,
        data: &[u8],
    ) -> Result<BufferId, ResourceError> {
        if data.len() as u64 > descriptor.size {
            return Err(ResourceError::OutOfBounds);
        }
        let mut contents = data.to_vec();
        contents.resize(descriptor.size as usize, 0);
        self.state()?.insert(descriptor, contents)
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError> {
        let mut state = self.state()?;
        if state.lost {
            // Everything was already released with the device.
            return Ok(());
        }
        let buffer = state.buffers.remove(&id).ok_or(ResourceError::NotFound)?;
        state.allocated_bytes -= buffer.data.len() as u64;
        state.stats.buffers_destroyed += 1;
        Ok(())
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ResourceError> {
        let mut state = self.state()?;
        state.ensure_alive()?;
        let buffer = state.buffers.get_mut(&id).ok_or(ResourceError::NotFound)?;
        let range = byte_range(offset, data.len() as u64, buffer.data.len())?;
        self.check_copy_alignment(offset, data.len() as u64)?;
        buffer.data[range].copy_from_slice(data);
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
        let mut state = self.state()?;
        state.ensure_alive()?;
        let src = state.buffer(source)?;
        let bytes = src.data[byte_range(source_offset, size, src.data.len())?].to_vec();

        let dst = state
            .buffers
            .get_mut(&destination)
            .ok_or(ResourceError::NotFound)?;
        let range = byte_range(destination_offset, size, dst.data.len())?;
        self.check_copy_alignment(source_offset, size)?;
        self.check_copy_alignment(destination_offset, size)?;
        dst.data[range].copy_from_slice(&bytes);
        Ok(())
    }

    fn read_buffer(&self, id: BufferId, offset: u64, size: u64) -> Result<Vec<u8>, ResourceError> {
        let state = self.state()?;
        state.ensure_alive()?;
        let buffer = state.buffer(id)?;
        if !buffer.usage.contains(BufferUsage::MAP_READ) {
            return Err(ResourceError::InvalidArgument(format!(
                "buffer {id:?} was not created with MAP_READ"
            )));
        }
        let range = byte_range(offset, size, buffer.data.len())?;
        Ok(buffer.data[range].to_vec())
    }

    fn insert_fence(&self) -> Result<FenceId, ResourceError> {
        let mut state = self.state()?;
        state.ensure_alive()?;
        state.last_fence += 1;
        let id = state.last_fence;
        state.live_fences.insert(id);
        state.stats.fences_inserted += 1;
        state.completed_through = state
            .completed_through
            .max(id.saturating_sub(self.latency));
        Ok(FenceId(id))
    }

    fn poll_fence(&self, fence: FenceId) -> Result<bool, ResourceError> {
        let mut state = self.state()?;
        state.ensure_alive()?;
        state.stats.fence_polls += 1;
        Ok(fence.0 <= state.completed_through)
    }

    fn wait_fence(&self, fence: FenceId) -> Result<(), ResourceError> {
        let mut state = self.state()?;
        state.ensure_alive()?;
        if !state.live_fences.contains(&fence.0) {
            return Err(ResourceError::FenceWaitFailed(format!(
                "unknown fence {fence:?}"
            )));
        }
        if fence.0 > state.completed_through {
            state.stats.fence_stalls += 1;
            state.completed_through = fence.0;
        }
        Ok(())
    }

    fn destroy_fence(&self, fence: FenceId) {
        if let Ok(mut state) = self.state.lock() {
            state.live_fences.remove(&fence.0);
        }
    }

    fn limits(&self) -> BufferDeviceLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_descriptor(size: u64) -> BufferDescriptor<'static> {
        BufferDescriptor::new("test", size, BufferUsage::VERTEX | BufferUsage::COPY_DST)
    }

    #[test]
    fn fences_lag_behind_by_latency() {
        let device = HeadlessBufferDevice::new().with_latency(2);

        let first = device.insert_fence().unwrap();
        let second = device.insert_fence().unwrap();
        assert!(!device.poll_fence(first).unwrap());

        let _third = device.insert_fence().unwrap();
        assert!(device.poll_fence(first).unwrap());
        assert!(!device.poll_fence(second).unwrap());

        device.wait_fence(second).unwrap();
        assert!(device.poll_fence(second).unwrap());
        assert_eq!(device.stats().fence_stalls, 1);
        assert_eq!(device.stats().fences_inserted, 3);
    }

    #[test]
    fn zero_latency_signals_immediately() {
        let device = HeadlessBufferDevice::new().with_latency(0);
        let fence = device.insert_fence().unwrap();
        assert!(device.poll_fence(fence).unwrap());
        device.wait_fence(fence).unwrap();
        assert_eq!(device.stats().fence_stalls, 0);
    }

    #[test]
    fn waiting_a_destroyed_fence_fails() {
        let device = HeadlessBufferDevice::new();
        let fence = device.insert_fence().unwrap();
        device.destroy_fence(fence);
        assert!(matches!(
            device.wait_fence(fence),
            Err(ResourceError::FenceWaitFailed(_))
        ));
    }

    #[test]
    fn budget_limits_creation() {
        let device = HeadlessBufferDevice::new().with_budget(100);
        let first = device.create_buffer(&upload_descriptor(64)).unwrap();
        assert_eq!(
            device.create_buffer(&upload_descriptor(64)),
            Err(ResourceError::OutOfDeviceMemory { requested_bytes: 64 })
        );

        device.destroy_buffer(first).unwrap();
        assert!(device.create_buffer(&upload_descriptor(64)).is_ok());
        assert_eq!(device.peak_bytes(), 64);
    }

    #[test]
    fn writes_copies_and_reads() {
        let device = HeadlessBufferDevice::new();
        let src = device
            .create_buffer_with_data(&upload_descriptor(8), &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(device.buffer_contents(src).unwrap(), vec![1, 2, 3, 4, 0, 0, 0, 0]);

        device.write_buffer(src, 4, &[5, 6, 7, 8]).unwrap();
        assert_eq!(device.write_buffer(src, 7, &[9, 9]), Err(ResourceError::OutOfBounds));

        let dst = device
            .create_buffer(&BufferDescriptor::new(
                "readback",
                4,
                BufferUsage::MAP_READ | BufferUsage::COPY_DST,
            ))
            .unwrap();
        device.copy_buffer_to_buffer(src, 4, dst, 0, 4).unwrap();
        assert_eq!(device.read_buffer(dst, 1, 3).unwrap(), vec![6, 7, 8]);

        // Vertex buffers are not host-readable.
        assert!(matches!(
            device.read_buffer(src, 0, 4),
            Err(ResourceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unaligned_transfers_are_rejected_like_wgpu() {
        let device = HeadlessBufferDevice::new();
        let src = device.create_buffer(&upload_descriptor(16)).unwrap();
        let dst = device.create_buffer(&upload_descriptor(16)).unwrap();

        assert!(matches!(
            device.write_buffer(src, 0, &[1; 6]),
            Err(ResourceError::InvalidArgument(_))
        ));
        assert!(matches!(
            device.write_buffer(src, 2, &[1; 4]),
            Err(ResourceError::InvalidArgument(_))
        ));
        assert!(matches!(
            device.copy_buffer_to_buffer(src, 0, dst, 2, 4),
            Err(ResourceError::InvalidArgument(_))
        ));
        assert_eq!(device.buffer_contents(src).unwrap(), vec![0; 16], "Nothing was written");

        let relaxed = HeadlessBufferDevice::new().with_limits(BufferDeviceLimits {
            copy_alignment: 1,
            ..Default::default()
        });
        let buffer = relaxed.create_buffer(&upload_descriptor(16)).unwrap();
        relaxed.write_buffer(buffer, 3, &[7; 3]).unwrap();
    }

    #[test]
    fn lost_device_rejects_work_until_restored() {
        let device = HeadlessBufferDevice::new();
        let buffer = device.create_buffer(&upload_descriptor(16)).unwrap();
        let fence = device.insert_fence().unwrap();

        device.lose_device();
        assert!(device.is_lost());
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.write_buffer(buffer, 0, &[1]), Err(ResourceError::DeviceLost));
        assert_eq!(device.poll_fence(fence), Err(ResourceError::DeviceLost));
        assert_eq!(device.destroy_buffer(buffer), Ok(()));

        device.restore_device();
        assert!(!device.is_lost());
        assert!(device.create_buffer(&upload_descriptor(16)).is_ok());
        assert_eq!(device.allocated_bytes(), 16);
    }
}
