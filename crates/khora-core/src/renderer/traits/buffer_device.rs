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

use crate::renderer::api::*;
use crate::renderer::error::ResourceError;
use std::fmt::Debug;

/// The resource-creation capability a graphics backend exposes to the buffer allocator.
///
/// Implementations own the physical API objects. The allocator only keeps the opaque
/// [`BufferId`]/[`FenceId`] values it receives, and hands them back for every operation.
/// All calls come from the single submission thread that drives the allocator.
pub trait BufferDevice: Send + Sync + Debug + 'static {
    /// Creates a new, uninitialized GPU buffer.
    /// ## Arguments
    /// * `descriptor` - A reference to a `BufferDescriptor` containing the buffer configuration.
    /// ## Returns
    /// A `Result` containing the ID of the created buffer or an error if the creation fails.
    /// ## Errors
    /// * `ResourceError::OutOfDeviceMemory` - If the device cannot hold the buffer.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferId, ResourceError>;

    /// Creates a new GPU buffer and initializes it with the provided data in one upload.
    /// This is the only way immutable pools are ever filled.
    /// ## Arguments
    /// * `descriptor` - A reference to a `BufferDescriptor` containing the buffer configuration.
    /// * `data` - The initial contents. Its length must not exceed `descriptor.size`.
    /// ## Returns
    /// A `Result` containing the ID of the created buffer or an error if the creation fails.
    fn create_buffer_with_data(
        &self,
        descriptor: &BufferDescriptor,
        data: &[u8],
    ) -> Result<BufferId, ResourceError>;

    /// Releases the buffer associated with the given ID.
    /// ## Arguments
    /// * `id` - The ID of the buffer to be destroyed.
    /// ## Returns
    /// A `Result` indicating success or failure of the operation.
    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError>;

    /// Writes data into a buffer at the given byte offset.
    /// The write is ordered with respect to previously submitted GPU work.
    /// ## Arguments
    /// * `id` - The destination buffer.
    /// * `offset` - Byte offset inside the buffer.
    /// * `data` - The bytes to write.
    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ResourceError>;

    /// Records and submits a GPU-side copy between two buffers.
    fn copy_buffer_to_buffer(
        &self,
        source: BufferId,
        source_offset: u64,
        destination: BufferId,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), ResourceError>;

    /// Reads back a range of a buffer created with [`BufferUsage::MAP_READ`].
    ///
    /// Blocks until every previously submitted write to the range has landed.
    fn read_buffer(&self, id: BufferId, offset: u64, size: u64) -> Result<Vec<u8>, ResourceError>;

    /// Inserts a fence after all the work submitted so far.
    /// ## Returns
    /// The ID of a fence that becomes signaled once that work completes.
    fn insert_fence(&self) -> Result<FenceId, ResourceError>;

    /// Non-blocking check of a fence.
    /// ## Returns
    /// `Ok(true)` once the fence is signaled, `Ok(false)` while the GPU is still busy.
    /// ## Errors
    /// * `ResourceError::FenceWaitFailed` - On a hard driver failure. This is never retried.
    fn poll_fence(&self, fence: FenceId) -> Result<bool, ResourceError>;

    /// Blocks the calling thread until the fence is signaled.
    /// ## Errors
    /// * `ResourceError::FenceWaitFailed` - On a hard driver failure. This is never retried.
    fn wait_fence(&self, fence: FenceId) -> Result<(), ResourceError>;

    /// Releases a fence. Unknown fences are ignored.
    fn destroy_fence(&self, fence: FenceId);

    /// Returns the alignment and size constraints of this device.
    fn limits(&self) -> BufferDeviceLimits;
}
