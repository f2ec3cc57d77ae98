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

//! Reference-counted staging buffers with a lifetime-based sweep.

use super::arena::{Arena, ArenaIndex};
use khora_core::renderer::{
    BufferDescriptor, BufferDevice, BufferId, BufferUsage, ResourceError,
};

/// Which way a staging buffer moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingDirection {
    /// CPU to GPU.
    Upload,
    /// GPU to CPU.
    Download,
}

impl StagingDirection {
    fn index(self) -> usize {
        match self {
            StagingDirection::Upload => 0,
            StagingDirection::Download => 1,
        }
    }

    fn usage(self) -> BufferUsage {
        match self {
            StagingDirection::Upload => BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC,
            StagingDirection::Download => BufferUsage::MAP_READ | BufferUsage::COPY_DST,
        }
    }
}

/// A handle to a staging buffer owned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StagingHandle(pub(crate) ArenaIndex);

#[derive(Debug, Clone)]
struct StagingBuffer {
    buffer: BufferId,
    size_bytes: u64,
    direction: StagingDirection,
    refcount: u32,
    last_used_ms: u64,
}

/// Every staging buffer, plus the unreferenced ones waiting to expire.
#[derive(Debug)]
pub(crate) struct StagingPool {
    buffers: Arena<StagingBuffer>,
    zero_ref: [Vec<StagingHandle>; 2],
    lifetime_ms: u64,
    min_size_bytes: u64,
    next_checkpoint_ms: u64,
}

impl StagingPool {
    pub fn new(lifetime_ms: u64, min_size_bytes: u64) -> Self {
        Self {
            buffers: Arena::new(),
            zero_ref: [Vec::new(), Vec::new()],
            lifetime_ms,
            min_size_bytes,
            next_checkpoint_ms: u64::MAX,
        }
    }

    /// Returns a referenced staging buffer of at least `min_size_bytes`.
    ///
    /// The smallest idle buffer that fits is revived first; otherwise a new one is created.
    pub fn acquire(
        &mut self,
        device: &dyn BufferDevice,
        min_size_bytes: u64,
        direction: StagingDirection,
    ) -> Result<StagingHandle, ResourceError> {
        let idle = &mut self.zero_ref[direction.index()];
        let best = idle
            .iter()
            .enumerate()
            .filter_map(|(i, h)| {
                self.buffers
                    .get(h.0)
                    .filter(|b| b.size_bytes >= min_size_bytes)
                    .map(|b| (i, b.size_bytes))
            })
            .min_by_key(|&(_, size)| size)
            .map(|(i, _)| i);

        if let Some(position) = best {
            let handle = idle.swap_remove(position);
            if let Some(buffer) = self.buffers.get_mut(handle.0) {
                buffer.refcount = 1;
            }
            return Ok(handle);
        }

        let size_bytes = min_size_bytes.max(self.min_size_bytes);
        let buffer = device.create_buffer(&BufferDescriptor::new(
            "Staging Buffer",
            size_bytes,
            direction.usage(),
        ))?;
        log::debug!("Created {direction:?} staging buffer of {size_bytes} bytes");
        Ok(StagingHandle(self.buffers.insert(StagingBuffer {
            buffer,
            size_bytes,
            direction,
            refcount: 1,
            last_used_ms: 0,
        })))
    }

    pub fn retain(&mut self, handle: StagingHandle) -> Result<(), ResourceError> {
        let buffer = self
            .buffers
            .get_mut(handle.0)
            .ok_or(ResourceError::InvalidHandle)?;
        if buffer.refcount == 0 {
            self.zero_ref[buffer.direction.index()].retain(|h| *h != handle);
        }
        buffer.refcount += 1;
        Ok(())
    }

    /// Drops a reference; an unreferenced buffer starts its idle lifetime at `now_ms`.
    pub fn release(&mut self, handle: StagingHandle, now_ms: u64) -> Result<(), ResourceError> {
        let buffer = self
            .buffers
            .get_mut(handle.0)
            .ok_or(ResourceError::InvalidHandle)?;
        if buffer.refcount == 0 {
            debug_assert!(false, "Staging buffer released more times than retained");
            return Err(ResourceError::InvalidHandle);
        }
        buffer.refcount -= 1;
        if buffer.refcount == 0 {
            buffer.last_used_ms = now_ms;
            self.zero_ref[buffer.direction.index()].push(handle);
            self.next_checkpoint_ms = self
                .next_checkpoint_ms
                .min(now_ms.saturating_add(self.lifetime_ms));
        }
        Ok(())
    }

    /// Destroys idle buffers whose lifetime ran out. Returns how many were destroyed.
    ///
    /// Does nothing before the next known expiry.
    pub fn sweep(&mut self, device: &dyn BufferDevice, now_ms: u64) -> usize {
        if now_ms < self.next_checkpoint_ms {
            return 0;
        }
        self.next_checkpoint_ms = u64::MAX;

        let mut destroyed = 0;
        for idle in &mut self.zero_ref {
            let mut i = 0;
            while i < idle.len() {
                let handle = idle[i];
                let Some(buffer) = self.buffers.get(handle.0) else {
                    idle.swap_remove(i);
                    continue;
                };
                let expiry = buffer.last_used_ms.saturating_add(self.lifetime_ms);
                if expiry < now_ms {
                    if let Err(e) = device.destroy_buffer(buffer.buffer) {
                        log::warn!("Failed to destroy staging buffer {:?}: {e}", buffer.buffer);
                    }
                    self.buffers.remove(handle.0);
                    idle.swap_remove(i);
                    destroyed += 1;
                } else {
                    self.next_checkpoint_ms = self.next_checkpoint_ms.min(expiry);
                    i += 1;
                }
            }
        }
        destroyed
    }

    pub fn buffer(&self, handle: StagingHandle) -> Option<BufferId> {
        self.buffers.get(handle.0).map(|b| b.buffer)
    }

    pub fn size_bytes(&self, handle: StagingHandle) -> Option<u64> {
        self.buffers.get(handle.0).map(|b| b.size_bytes)
    }

    pub fn refcount(&self, handle: StagingHandle) -> u32 {
        self.buffers.get(handle.0).map_or(0, |b| b.refcount)
    }

    /// Number of staging buffers alive, referenced or not.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Destroys every staging buffer through the device.
    pub fn destroy_all(&mut self, device: &dyn BufferDevice) {
        for (_, buffer) in self.buffers.iter() {
            if let Err(e) = device.destroy_buffer(buffer.buffer) {
                log::warn!("Failed to destroy staging buffer {:?}: {e}", buffer.buffer);
            }
        }
        self.forget_all();
    }

    /// Drops every staging buffer without touching the device.
    pub fn forget_all(&mut self) {
        self.buffers = Arena::new();
        self.zero_ref = [Vec::new(), Vec::new()];
        self.next_checkpoint_ms = u64::MAX;
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::MockBufferDevice;
    use super::*;

    #[test]
    fn idle_buffer_is_reused_before_expiry() {
        let device = MockBufferDevice::new();
        let mut pool = StagingPool::new(1000, 64);

        let first = pool
            .acquire(&device, 32, StagingDirection::Download)
            .unwrap();
        assert_eq!(pool.size_bytes(first), Some(64));
        pool.release(first, 10).unwrap();

        let again = pool
            .acquire(&device, 48, StagingDirection::Download)
            .unwrap();
        assert_eq!(again, first);
        assert_eq!(device.live_buffers(), 1);

        let upload = pool.acquire(&device, 16, StagingDirection::Upload).unwrap();
        assert_ne!(upload, first, "Directions never share buffers");
    }

    #[test]
    fn sweep_destroys_only_expired_buffers() {
        let device = MockBufferDevice::new();
        let mut pool = StagingPool::new(100, 16);
        let old = pool.acquire(&device, 16, StagingDirection::Upload).unwrap();
        let young = pool.acquire(&device, 16, StagingDirection::Upload).unwrap();
        pool.release(old, 0).unwrap();
        pool.release(young, 80).unwrap();

        assert_eq!(pool.sweep(&device, 50), 0, "Before the first expiry");
        assert_eq!(pool.sweep(&device, 101), 1);
        assert!(pool.buffer(old).is_none());
        assert!(pool.buffer(young).is_some());

        assert_eq!(pool.sweep(&device, 150), 0);
        assert_eq!(pool.sweep(&device, 181), 1);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn referenced_buffers_never_expire() {
        let device = MockBufferDevice::new();
        let mut pool = StagingPool::new(10, 16);
        let held = pool.acquire(&device, 16, StagingDirection::Download).unwrap();
        pool.retain(held).unwrap();
        pool.release(held, 0).unwrap();

        assert_eq!(pool.sweep(&device, 1_000), 0);
        assert_eq!(pool.refcount(held), 1);
    }
}
