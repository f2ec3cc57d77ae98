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

//! Asynchronous GPU to CPU readback.

use super::buffer::BufferHandle;
use super::manager::GpuBufferManager;
use super::staging::{StagingDirection, StagingHandle};
use khora_core::renderer::api::align_to_next;
use khora_core::renderer::ResourceError;

/// A pending copy of buffer contents into CPU-readable memory.
///
/// The copy is recorded when the ticket is created and becomes readable once the frame
/// it was recorded in has finished on the GPU.
#[derive(Debug, PartialEq, Eq)]
pub struct ReadbackTicket {
    staging: StagingHandle,
    frame: u32,
    /// Where the requested bytes start inside the aligned copy.
    offset: u64,
    size_bytes: u64,
}

impl ReadbackTicket {
    /// The frame the copy was recorded in.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Number of bytes the ticket reads back.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl GpuBufferManager {
    /// Records a copy of `elem_count` elements of `handle` into a download staging buffer.
    ///
    /// Every pending immutable buffer is flushed first, with a performance warning: the
    /// reader must never race a buffer that has not been created yet. The copy itself
    /// covers the requested range widened to the device's copy alignment.
    pub fn create_readback_ticket(
        &mut self,
        handle: BufferHandle,
        elem_start: u64,
        elem_count: u64,
    ) -> Result<ReadbackTicket, ResourceError> {
        self.ensure_device()?;
        self.force_flush("a readback ticket")?;

        let packed = self.packed(handle)?;
        if !matches!(elem_start.checked_add(elem_count), Some(end) if end <= packed.num_elements) {
            return Err(ResourceError::OutOfBounds);
        }
        let start = elem_start * packed.bytes_per_element;
        let size_bytes = elem_count * packed.bytes_per_element;
        let copy_alignment = self.copy_alignment();
        let window_start = start - start % copy_alignment;
        let window_bytes = align_to_next(start + size_bytes, copy_alignment) - window_start;
        let binding = self.current_binding(handle)?;
        let source = binding.buffer.ok_or(ResourceError::DeviceLost)?;

        let staging = self
            .staging
            .acquire(self.device.as_ref(), window_bytes, StagingDirection::Download)?;
        let copied = match self.staging.buffer(staging) {
            Some(destination) => self.device.copy_buffer_to_buffer(
                source,
                binding.offset + window_start,
                destination,
                0,
                window_bytes,
            ),
            None => Err(ResourceError::InvalidHandle),
        };
        if let Err(e) = copied {
            self.release_staging_buffer(staging)?;
            return Err(e);
        }

        Ok(ReadbackTicket {
            staging,
            frame: self.frame_count(),
            offset: start - window_start,
            size_bytes,
        })
    }

    /// Returns whether the ticket's data can be read without blocking.
    pub fn is_ticket_ready(&mut self, ticket: &ReadbackTicket) -> Result<bool, ResourceError> {
        self.is_frame_finished(ticket.frame)
    }

    /// Waits for the ticket's frame and returns the copied bytes.
    pub fn map_ticket(&mut self, ticket: &ReadbackTicket) -> Result<Vec<u8>, ResourceError> {
        self.wait_for_specific_frame_to_finish(ticket.frame)?;
        let buffer = self
            .staging
            .buffer(ticket.staging)
            .ok_or(ResourceError::InvalidHandle)?;
        self.device
            .read_buffer(buffer, ticket.offset, ticket.size_bytes)
    }

    /// Gives the ticket's staging buffer back.
    pub fn release_ticket(&mut self, ticket: ReadbackTicket) -> Result<(), ResourceError> {
        self.release_staging_buffer(ticket.staging)
    }
}
