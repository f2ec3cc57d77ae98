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

//! Sub-allocation of GPU buffers.
//!
//! [`GpuBufferManager`] multiplexes many small logical buffers onto a few large device
//! buffers ("pools"). Free space inside a pool is tracked by a coalescing free list,
//! immutable buffers are created in deferred batches, dynamic buffers are multi-buffered
//! behind per-frame fences, and identical vertex/index binding combinations are shared
//! through a reference-counted VAO cache.
//!
//! The manager talks to the GPU only through [`khora_core::renderer::BufferDevice`].

mod arena;
mod block;
mod buffer;
mod frame_fence;
mod immutable;
mod lifecycle;
mod manager;
mod pool;
mod readback;
mod staging;
mod stats;
mod vao_cache;

#[cfg(test)]
mod mock;

pub use self::arena::ArenaIndex;
pub use self::block::{Block, FreeList, StrideChanger, StrideChangerList};
pub use self::buffer::{BufferBinding, BufferHandle, BufferInfo, BufferKind, MappingState};
pub use self::frame_fence::{FenceSlot, FrameFenceRing, FrameWait};
pub use self::manager::{
    render_queue_id, GpuBufferManager, VaoHandle, VertexBufferInput,
};
pub use self::pool::PoolKey;
pub use self::readback::ReadbackTicket;
pub use self::staging::{StagingDirection, StagingHandle};
pub use self::stats::{MemoryStats, MemoryStatsEntry};
pub use self::vao_cache::{IndexBinding, VaoCache, VaoKey, VaoLease, VaoSlot, VertexBinding};
