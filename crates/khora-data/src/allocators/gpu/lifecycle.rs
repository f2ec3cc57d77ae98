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

//! Frame cadence, staging buffers and device loss for [`GpuBufferManager`].

use super::buffer::MappingState;
use super::frame_fence::FrameWait;
use super::manager::{
    pool_descriptor, render_queue_id, widen_write, DelayedBuffer, GpuBufferManager,
};
use super::staging::{StagingDirection, StagingHandle};
use khora_core::renderer::api::align_to_next;
use khora_core::renderer::{BufferId, BufferType, PoolCategory, ResourceError};

impl GpuBufferManager {
    // --- Frame bookkeeping ---

    /// Starts a frame: realizes the immutable buffers queued since the last one.
    pub fn begin_frame(&mut self) -> Result<(), ResourceError> {
        self.ensure_device()?;
        self.flush_pending()
    }

    /// Ends a frame, using the manager's own clock for staging buffer lifetimes.
    pub fn update(&mut self) -> Result<(), ResourceError> {
        let now_ms = self.timer.elapsed_ms();
        self.update_at(now_ms)
    }

    /// Ends a frame at `now_ms`.
    ///
    /// In order: expired staging buffers are destroyed, dynamic buffers destroyed while
    /// the current ring slot was last written are freed, then the frame fence ring
    /// advances, blocking if the GPU is N frames behind.
    pub fn update_at(&mut self, now_ms: u64) -> Result<(), ResourceError> {
        self.ensure_device()?;

        let destroyed = self.staging.sweep(self.device.as_ref(), now_ms);
        if destroyed > 0 {
            log::debug!("Destroyed {destroyed} expired staging buffers");
        }

        self.destroy_delayed_buffers()?;
        self.fences.advance_frame(self.device.as_ref())
    }

    fn destroy_delayed_buffers(&mut self) -> Result<(), ResourceError> {
        let slot = self.fences.current_slot();
        let frame = self.fences.frame_count();
        let due = |d: &DelayedBuffer| d.slot == slot && d.frame != frame;

        if !self.delayed_destroy.front().is_some_and(|d| due(d)) {
            return Ok(());
        }
        self.fences.wait_for_tail_frame(self.device.as_ref())?;
        while self.delayed_destroy.front().is_some_and(|d| due(d)) {
            if let Some(d) = self.delayed_destroy.pop_front() {
                self.release_range(d.key, d.pool_index, d.offset, d.reserved_bytes)?;
            }
        }
        Ok(())
    }

    fn destroy_all_delayed_buffers(&mut self) -> Result<(), ResourceError> {
        while let Some(d) = self.delayed_destroy.pop_front() {
            self.release_range(d.key, d.pool_index, d.offset, d.reserved_bytes)?;
        }
        Ok(())
    }

    /// Frames advanced since creation, wrapping.
    pub fn frame_count(&self) -> u32 {
        self.fences.frame_count()
    }

    /// The ring slot dynamic buffers write this frame.
    pub fn dynamic_buffer_current_frame(&self) -> u8 {
        self.fences.current_slot()
    }

    /// Blocks until the GPU is done with the current ring slot and returns it.
    pub fn wait_for_tail_frame_to_finish(&mut self) -> Result<u8, ResourceError> {
        self.ensure_device()?;
        self.fences.wait_for_tail_frame(self.device.as_ref())
    }

    /// Blocks until `frame` has finished on the GPU.
    ///
    /// Waiting on the frame still being recorded is a full stall; every delayed dynamic
    /// buffer is freed afterwards since nothing can still be reading it.
    pub fn wait_for_specific_frame_to_finish(&mut self, frame: u32) -> Result<(), ResourceError> {
        self.ensure_device()?;
        let waited = self
            .fences
            .wait_for_specific_frame(self.device.as_ref(), frame)?;
        if waited == FrameWait::FullStall {
            log::debug!("Full GPU stall waiting for frame {frame}");
            self.destroy_all_delayed_buffers()?;
        }
        Ok(())
    }

    /// Returns whether `frame` has finished on the GPU, without blocking.
    pub fn is_frame_finished(&mut self, frame: u32) -> Result<bool, ResourceError> {
        self.ensure_device()?;
        self.fences.is_frame_finished(self.device.as_ref(), frame)
    }

    // --- Staging buffers ---

    /// Returns a referenced staging buffer of at least `min_size_bytes`, rounded up to the
    /// device's copy alignment.
    pub fn get_staging_buffer(
        &mut self,
        min_size_bytes: u64,
        direction: StagingDirection,
    ) -> Result<StagingHandle, ResourceError> {
        self.ensure_device()?;
        let size_bytes = align_to_next(min_size_bytes, self.copy_alignment());
        self.staging
            .acquire(self.device.as_ref(), size_bytes, direction)
    }

    /// Takes one more reference on a staging buffer.
    pub fn retain_staging_buffer(&mut self, handle: StagingHandle) -> Result<(), ResourceError> {
        self.staging.retain(handle)
    }

    /// Drops a reference. Unreferenced staging buffers are destroyed by [`update`](Self::update)
    /// once idle for longer than the configured lifetime.
    pub fn release_staging_buffer(&mut self, handle: StagingHandle) -> Result<(), ResourceError> {
        let now_ms = self.timer.elapsed_ms();
        self.staging.release(handle, now_ms)
    }

    /// The device buffer behind a staging handle.
    pub fn staging_buffer_id(&self, handle: StagingHandle) -> Option<BufferId> {
        self.staging.buffer(handle)
    }

    /// The size of a staging buffer, which may exceed what was asked for.
    pub fn staging_buffer_size(&self, handle: StagingHandle) -> Option<u64> {
        self.staging.size_bytes(handle)
    }

    /// References currently held on a staging buffer, 0 once it is idle or gone.
    pub fn staging_buffer_refcount(&self, handle: StagingHandle) -> u32 {
        self.staging.refcount(handle)
    }

    /// Number of staging buffers alive, referenced or idle.
    pub fn staging_buffer_count(&self) -> usize {
        self.staging.len()
    }

    // --- Device loss ---

    /// Forgets every device object after the device was lost.
    ///
    /// Pools keep their bookkeeping but lose their buffers. Fences are discarded without
    /// being waited on. Until [`on_device_restored`](Self::on_device_restored) succeeds,
    /// allocating calls fail with [`ResourceError::DeviceLost`].
    pub fn on_device_lost(&mut self) {
        log::warn!("GPU device lost, dropping every buffer and fence handle");

        let mut dropped_maps = 0;
        for (_, pool) in self.pools.iter_mut() {
            pool.buffer = None;
            if let Some(ring) = pool.dynamic_ring.as_mut() {
                dropped_maps += ring.mapped_count();
                ring.discard_all();
            }
        }
        if dropped_maps > 0 {
            log::warn!("Discarded {dropped_maps} mapped regions that were never unmapped");
        }
        for (_, packed) in self.buffers.iter_mut() {
            packed.mapping = MappingState::Unmapped;
        }

        self.fences.discard_all();
        while let Some(d) = self.delayed_destroy.pop_front() {
            if let Err(e) = self
                .pools
                .deallocate(d.key, d.pool_index, d.offset, d.reserved_bytes)
            {
                log::error!("Failed to free a delayed {} buffer: {e}", d.key.name());
            }
        }
        self.staging.forget_all();

        self.vao_cache.clear();
        for (_, vao) in self.vaos.iter_mut() {
            vao.slot = None;
            vao.vao_name = 0;
            vao.render_queue_id = render_queue_id(0, vao.unique_id);
        }
        self.device_lost = true;
    }

    /// Recreates every device buffer after the device came back.
    ///
    /// Default, shared and dynamic pools get a fresh buffer of the same size and the shadow
    /// copies of their live buffers are uploaded again. Immutable pools still holding live
    /// buffers are rebuilt from those buffers' shadow copies; buffers without one come
    /// back zero-filled. Logical buffer offsets do not change.
    pub fn on_device_restored(&mut self) -> Result<(), ResourceError> {
        let device = self.device.clone();
        let copy_alignment = self.copy_alignment();

        for (key, pool) in self.pools.iter_mut() {
            if pool.released || pool.buffer.is_some() || key.category == PoolCategory::Immutable {
                continue;
            }
            pool.buffer = Some(device.create_buffer(&pool_descriptor(key, pool.size_bytes))?);
        }

        let immutable: Vec<_> = self
            .pools
            .iter()
            .filter(|(key, _, pool)| {
                key.category == PoolCategory::Immutable && !pool.released && pool.buffer.is_none()
            })
            .map(|(key, index, pool)| (key, index, pool.size_bytes))
            .collect();
        for (key, pool_index, size_bytes) in immutable {
            let mut contents = vec![0u8; size_bytes as usize];
            let mut zero_filled = 0;
            for (_, packed) in self.buffers.iter() {
                if packed.key() != key || packed.realized().map(|(i, _)| i) != Some(pool_index) {
                    continue;
                }
                let Some((_, offset)) = packed.realized() else {
                    continue;
                };
                match &packed.shadow {
                    Some(shadow) => {
                        contents[offset as usize..][..shadow.len()].copy_from_slice(shadow)
                    }
                    None => zero_filled += 1,
                }
            }
            if zero_filled > 0 {
                log::warn!(
                    "{zero_filled} immutable buffers of {} pool #{pool_index} had no shadow copy and were restored zero-filled",
                    key.name()
                );
            }
            let buffer = device.create_buffer_with_data(&pool_descriptor(key, size_bytes), &contents)?;
            if let Some(pool) = self.pools.pool_mut(key, pool_index) {
                pool.buffer = Some(buffer);
            }
        }

        for (_, packed) in self.buffers.iter() {
            if packed.buffer_type == BufferType::Immutable {
                continue;
            }
            let (Some((pool_index, offset)), Some(shadow)) = (packed.realized(), &packed.shadow)
            else {
                continue;
            };
            let Some(buffer) = self.pools.pool(packed.key(), pool_index).and_then(|p| p.buffer)
            else {
                continue;
            };
            let copies = if packed.buffer_type.is_dynamic() {
                u64::from(self.multiplier)
            } else {
                1
            };
            let (_, bytes) = widen_write(0, shadow, packed.size_bytes(), None, copy_alignment)?;
            for slot in 0..copies {
                device.write_buffer(buffer, offset + slot * packed.slice_bytes, &bytes)?;
            }
        }

        self.device_lost = false;
        self.rebind_vaos(|_| true);
        log::info!("GPU buffers restored");
        Ok(())
    }
}

impl Drop for GpuBufferManager {
    /// Gives every pool buffer, staging buffer and frame fence back to the device.
    fn drop(&mut self) {
        if self.device_lost {
            return;
        }
        let device = self.device.clone();
        self.staging.destroy_all(device.as_ref());
        self.fences.reset(device.as_ref());

        let mut destroyed = 0;
        for (key, pool) in self.pools.iter_mut() {
            let Some(buffer) = pool.buffer.take() else {
                continue;
            };
            if let Err(e) = device.destroy_buffer(buffer) {
                log::error!("Failed to destroy {} pool buffer {buffer:?}: {e}", key.name());
            }
            destroyed += 1;
        }
        log::debug!("GPU buffer manager dropped, {destroyed} pool buffers released");
    }
}
