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

//! An in-memory [`BufferDevice`] used by the unit tests of this module.

use khora_core::renderer::{
    BufferDescriptor, BufferDevice, BufferDeviceLimits, BufferId, BufferUsage, FenceId,
    ResourceError,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
struct MockBuffer {
    data: Vec<u8>,
    usage: BufferUsage,
}

#[derive(Debug, Default)]
struct MockState {
    buffers: HashMap<BufferId, MockBuffer>,
    live_fences: HashSet<u64>,
    signaled_through: u64,
    waits: Vec<FenceId>,
    polls: usize,
    destroyed_buffers: Vec<BufferId>,
    budget: Option<u64>,
    used: u64,
    fail_writes: bool,
    fail_fences: bool,
}

/// Buffers are byte vectors; fences signal only when waited on or explicitly signaled.
#[derive(Debug)]
pub(crate) struct MockBufferDevice {
    next_buffer_id: AtomicUsize,
    next_fence_id: AtomicU64,
    fences_inserted: AtomicUsize,
    limits: BufferDeviceLimits,
    state: Mutex<MockState>,
}

impl MockBufferDevice {
    pub fn new() -> Self {
        Self::with_limits(BufferDeviceLimits::default())
    }

    pub fn with_limits(limits: BufferDeviceLimits) -> Self {
        Self {
            next_buffer_id: AtomicUsize::new(1),
            next_fence_id: AtomicU64::new(1),
            fences_inserted: AtomicUsize::new(0),
            limits,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Makes creations fail once `bytes` of buffers are alive.
    pub fn set_budget(&self, bytes: u64) {
        self.state.lock().unwrap().budget = Some(bytes);
    }

    /// Makes every write fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    /// Makes every fence insertion fail with a backend error.
    pub fn set_fail_fences(&self, fail: bool) {
        self.state.lock().unwrap().fail_fences = fail;
    }

    /// Pretends the GPU finished everything submitted so far.
    pub fn signal_all(&self) {
        let last = self.next_fence_id.load(Ordering::SeqCst);
        self.state.lock().unwrap().signaled_through = last;
    }

    pub fn waits(&self) -> Vec<FenceId> {
        self.state.lock().unwrap().waits.clone()
    }

    pub fn polls(&self) -> usize {
        self.state.lock().unwrap().polls
    }

    pub fn fences_inserted(&self) -> usize {
        self.fences_inserted.load(Ordering::SeqCst)
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().unwrap().live_fences.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().unwrap().buffers.len()
    }

    pub fn destroyed_buffers(&self) -> Vec<BufferId> {
        self.state.lock().unwrap().destroyed_buffers.clone()
    }

    pub fn buffer_size(&self, id: BufferId) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .buffers
            .get(&id)
            .map(|b| b.data.len() as u64)
    }

    pub fn buffer_usage(&self, id: BufferId) -> Option<BufferUsage> {
        self.state.lock().unwrap().buffers.get(&id).map(|b| b.usage)
    }

    pub fn contents(&self, id: BufferId, offset: u64, size: u64) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let data = &state.buffers[&id].data;
        data[offset as usize..(offset + size) as usize].to_vec()
    }

    /// Same rule as the wgpu backend: offsets and sizes of transfers are whole words.
    fn check_copy_alignment(&self, offset: u64, size: u64) -> Result<(), ResourceError> {
        let alignment = self.limits.copy_alignment.max(1);
        if offset % alignment != 0 || size % alignment != 0 {
            return Err(ResourceError::InvalidArgument(format!(
                "unaligned transfer (offset {offset}, size {size})"
            )));
        }
        Ok(())
    }

    fn insert_buffer(
        &self,
        descriptor: &BufferDescriptor,
        data: Vec<u8>,
    ) -> Result<BufferId, ResourceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(budget) = state.budget {
            if state.used + descriptor.size > budget {
                return Err(ResourceError::OutOfDeviceMemory {
                    requested_bytes: descriptor.size,
                });
            }
        }
        state.used += descriptor.size;
        let id = BufferId(self.next_buffer_id.fetch_add(1, Ordering::SeqCst));
        state.buffers.insert(
            id,
            MockBuffer {
                data,
                usage: descriptor.usage,
            },
        );
        Ok(id)
    }
}

impl BufferDevice for MockBufferDevice {
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferId, ResourceError> {
        self.insert_buffer(descriptor, vec![0; descriptor.size as usize])
    }

    fn create_buffer_with_data(
        &self,
        descriptor: &BufferDescriptor,
        data: &[u8],
    ) -> Result<BufferId, ResourceError> {
        let mut contents = data.to_vec();
        contents.resize(descriptor.size as usize, 0);
        self.insert_buffer(descriptor, contents)
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError> {
        let mut state = self.state.lock().unwrap();
        let buffer = state.buffers.remove(&id).ok_or(ResourceError::NotFound)?;
        state.used -= buffer.data.len() as u64;
        state.destroyed_buffers.push(id);
        Ok(())
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ResourceError> {
        self.check_copy_alignment(offset, data.len() as u64)?;
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(ResourceError::BackendError("write rejected".into()));
        }
        let buffer = state.buffers.get_mut(&id).ok_or(ResourceError::NotFound)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > buffer.data.len() {
            return Err(ResourceError::OutOfBounds);
        }
        buffer.data[start..end].copy_from_slice(data);
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
        self.check_copy_alignment(source_offset, size)?;
        self.check_copy_alignment(destination_offset, size)?;
        let bytes = {
            let state = self.state.lock().unwrap();
            let src = state.buffers.get(&source).ok_or(ResourceError::NotFound)?;
            let start = source_offset as usize;
            src.data
                .get(start..start + size as usize)
                .ok_or(ResourceError::OutOfBounds)?
                .to_vec()
        };
        self.write_buffer(destination, destination_offset, &bytes)
    }

    fn read_buffer(&self, id: BufferId, offset: u64, size: u64) -> Result<Vec<u8>, ResourceError> {
        let state = self.state.lock().unwrap();
        let buffer = state.buffers.get(&id).ok_or(ResourceError::NotFound)?;
        if !buffer.usage.contains(BufferUsage::MAP_READ) {
            return Err(ResourceError::InvalidArgument("buffer is not readable".into()));
        }
        let start = offset as usize;
        buffer
            .data
            .get(start..start + size as usize)
            .map(<[u8]>::to_vec)
            .ok_or(ResourceError::OutOfBounds)
    }

    fn insert_fence(&self) -> Result<FenceId, ResourceError> {
        if self.state.lock().unwrap().fail_fences {
            return Err(ResourceError::BackendError("fence rejected".into()));
        }
        let id = self.next_fence_id.fetch_add(1, Ordering::SeqCst);
        self.fences_inserted.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().live_fences.insert(id);
        Ok(FenceId(id))
    }

    fn poll_fence(&self, fence: FenceId) -> Result<bool, ResourceError> {
        let mut state = self.state.lock().unwrap();
        state.polls += 1;
        Ok(fence.0 <= state.signaled_through)
    }

    fn wait_fence(&self, fence: FenceId) -> Result<(), ResourceError> {
        let mut state = self.state.lock().unwrap();
        if !state.live_fences.contains(&fence.0) {
            return Err(ResourceError::FenceWaitFailed(format!(
                "unknown fence {fence:?}"
            )));
        }
        state.waits.push(fence);
        state.signaled_through = state.signaled_through.max(fence.0);
        Ok(())
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.state.lock().unwrap().live_fences.remove(&fence.0);
    }

    fn limits(&self) -> BufferDeviceLimits {
        self.limits
    }
}
