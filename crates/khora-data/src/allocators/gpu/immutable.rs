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

//! Deferred creation of immutable buffers.
//!
//! Immutable device buffers cannot be resized or partially written after creation, so
//! requests are queued per internal type and merged into as few pools as possible when
//! the queue is flushed. Batches are closed greedily: as soon as the next entry would
//! overflow the maximum pool size, a new batch starts.

use super::block::StrideChanger;
use super::buffer::BufferHandle;
use khora_core::renderer::api::align_to_next;
use khora_core::renderer::InternalBufferType;

/// A queued immutable buffer, as seen by the batch planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingEntry {
    pub handle: BufferHandle,
    pub alignment: u64,
    pub size: u64,
}

/// Immutable buffers waiting for the next flush, per internal type, in request order.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingQueues {
    queues: [Vec<BufferHandle>; 3],
}

impl PendingQueues {
    /// Queues a buffer for the next flush of its bucket.
    pub fn push(&mut self, internal: InternalBufferType, handle: BufferHandle) {
        self.queues[internal.index()].push(handle);
    }

    /// Dequeues a buffer destroyed before it was ever realized.
    pub fn remove(&mut self, internal: InternalBufferType, handle: BufferHandle) -> bool {
        let queue = &mut self.queues[internal.index()];
        let before = queue.len();
        queue.retain(|h| *h != handle);
        queue.len() != before
    }

    /// Empties the queue of one bucket, in creation order.
    pub fn take(&mut self, internal: InternalBufferType) -> Vec<BufferHandle> {
        std::mem::take(&mut self.queues[internal.index()])
    }

    /// Buffers waiting across all buckets.
    pub fn len(&self) -> usize {
        self.queues.iter().map(Vec::len).sum()
    }

    /// Returns `true` if no bucket has a buffer waiting.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(Vec::is_empty)
    }
}

/// Where one pending buffer lands inside its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchSlot {
    pub handle: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

/// One future immutable pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BatchPlan {
    pub slots: Vec<BatchSlot>,
    pub size_bytes: u64,
    pub stride_changers: Vec<StrideChanger>,
}

impl BatchPlan {
    /// Copies every entry's data at its planned offset into one upload buffer.
    pub fn merge<'a>(&self, mut data_of: impl FnMut(BufferHandle) -> Option<&'a [u8]>) -> Vec<u8> {
        let mut scratch = vec![0u8; self.size_bytes as usize];
        for slot in &self.slots {
            if let Some(data) = data_of(slot.handle) {
                let start = slot.offset as usize;
                let len = data.len().min(slot.size as usize);
                scratch[start..start + len].copy_from_slice(&data[..len]);
            }
        }
        scratch
    }
}

/// Splits the queue into batches no larger than `max_pool_size`.
///
/// Each entry is placed at the running total rounded up to its alignment. A batch always
/// accepts its first entry, so an oversized buffer gets a pool of its own.
pub(crate) fn plan_batches(entries: &[PendingEntry], max_pool_size: u64) -> Vec<BatchPlan> {
    let mut batches = Vec::new();
    let mut current = BatchPlan::default();

    for entry in entries {
        let mut offset = align_to_next(current.size_bytes, entry.alignment);
        if !current.slots.is_empty() && offset + entry.size > max_pool_size {
            batches.push(std::mem::take(&mut current));
            offset = 0;
        }
        if offset != current.size_bytes {
            current.stride_changers.push(StrideChanger {
                offset,
                padded_bytes: offset - current.size_bytes,
            });
        }
        current.slots.push(BatchSlot {
            handle: entry.handle,
            offset,
            size: entry.size,
        });
        current.size_bytes = offset + entry.size;
    }

    if !current.slots.is_empty() {
        batches.push(current);
    }
    batches
}
