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

//! Logical buffers handed out to clients.

use super::arena::ArenaIndex;
use super::pool::PoolKey;
use khora_core::renderer::{
    BufferId, BufferType, BufferUsage, IndexFormat, InternalBufferType, VertexAttributeDescriptor,
};

/// A handle to a logical buffer owned by a [`GpuBufferManager`](super::GpuBufferManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) ArenaIndex);

/// What a logical buffer is used for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferKind {
    /// Per-vertex or per-instance attributes.
    Vertex {
        /// Layout of one element.
        attributes: Vec<VertexAttributeDescriptor>,
    },
    /// Vertex indices.
    Index(IndexFormat),
    /// Uniform data.
    Const,
    /// Texel buffer data.
    Tex,
    /// Structured buffer readable and writable from shaders.
    Uav,
    /// Indirect draw or dispatch arguments.
    Indirect,
}

impl BufferKind {
    /// The pool family the buffer lives in.
    pub fn internal_type(&self) -> InternalBufferType {
        match self {
            BufferKind::Vertex { .. } => InternalBufferType::Vertex,
            BufferKind::Index(_) => InternalBufferType::Index,
            BufferKind::Const | BufferKind::Tex | BufferKind::Uav | BufferKind::Indirect => {
                InternalBufferType::Shader
            }
        }
    }
}

/// Device usage flags of pools of the given internal type.
pub(crate) fn pool_usage(internal: InternalBufferType) -> BufferUsage {
    let common = BufferUsage::COPY_DST | BufferUsage::COPY_SRC;
    match internal {
        InternalBufferType::Vertex => common | BufferUsage::VERTEX,
        InternalBufferType::Index => common | BufferUsage::INDEX,
        InternalBufferType::Shader => {
            common | BufferUsage::UNIFORM | BufferUsage::STORAGE | BufferUsage::INDIRECT
        }
    }
}

/// Where the bytes of a logical buffer live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Queued in the immutable batcher; no pool space yet.
    Pending,
    /// Sub-allocated inside a pool.
    Realized { pool_index: usize, offset: u64 },
}

/// The CPU mapping state of a dynamic buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// Not mapped.
    Unmapped,
    /// Mapped for writing at the given pool byte offset.
    Mapped {
        /// Absolute byte offset of the mapped range inside the pool.
        pool_offset: u64,
    },
}

/// Book-keeping of one logical buffer.
#[derive(Debug, Clone)]
pub(crate) struct BufferPacked {
    pub kind: BufferKind,
    pub buffer_type: BufferType,
    pub num_elements: u64,
    pub bytes_per_element: u64,
    pub alignment: u64,
    /// Bytes reserved for one ring slice, aligned for shader bindings.
    pub slice_bytes: u64,
    pub placement: Placement,
    /// Owned copy of the initial contents while the buffer waits in the batcher.
    pub initial_data: Option<Vec<u8>>,
    pub shadow: Option<Vec<u8>>,
    pub mapping: MappingState,
    /// Ring slot last written through a map, so draws bind the fresh slice.
    pub active_slot: u8,
}

impl BufferPacked {
    pub fn key(&self) -> PoolKey {
        PoolKey::new(self.kind.internal_type(), self.buffer_type.pool_category())
    }

    /// Size of the client-visible contents.
    pub fn size_bytes(&self) -> u64 {
        self.num_elements * self.bytes_per_element
    }

    /// Pool bytes reserved for this buffer, including every ring slice.
    pub fn reserved_bytes(&self, multiplier: u8) -> u64 {
        if self.buffer_type.is_dynamic() {
            self.slice_bytes * u64::from(multiplier)
        } else {
            self.slice_bytes
        }
    }

    pub fn is_pending(&self) -> bool {
        self.placement == Placement::Pending
    }

    pub fn realized(&self) -> Option<(usize, u64)> {
        match self.placement {
            Placement::Realized { pool_index, offset } => Some((pool_index, offset)),
            Placement::Pending => None,
        }
    }
}

/// A read-only snapshot of a logical buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    /// What the buffer is used for.
    pub kind: BufferKind,
    /// Requested usage.
    pub buffer_type: BufferType,
    /// Number of elements.
    pub num_elements: u64,
    /// Size of one element.
    pub bytes_per_element: u64,
    /// Bucket of the owning pool.
    pub pool_key: PoolKey,
    /// Index of the owning pool; `None` while pending in the batcher.
    pub pool_index: Option<usize>,
    /// Byte offset inside the owning pool; `None` while pending.
    pub offset: Option<u64>,
    /// Pool bytes reserved, every ring slice included.
    pub reserved_bytes: u64,
    /// Current mapping state.
    pub mapping: MappingState,
}

/// What a draw call needs to bind a logical buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    /// The device buffer of the owning pool, `None` while pending or after device loss.
    pub buffer: Option<BufferId>,
    /// Byte offset of the active contents inside that buffer.
    pub offset: u64,
    /// Size of the contents in bytes.
    pub size: u64,
}
