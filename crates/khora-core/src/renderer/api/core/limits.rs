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

//! Capabilities reported by a buffer device.

/// Alignment and size constraints of a [`BufferDevice`](crate::renderer::BufferDevice).
///
/// These are queried once when an allocator is created and never change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDeviceLimits {
    /// Required offset alignment of constant (uniform) buffer bindings.
    pub const_buffer_alignment: u64,
    /// Required offset alignment of texel buffer bindings.
    pub tex_buffer_alignment: u64,
    /// Required offset alignment of structured (storage) buffer bindings.
    pub uav_buffer_alignment: u64,
    /// Largest constant buffer binding, in bytes.
    pub const_buffer_max_size: u64,
    /// Largest texel buffer binding, in bytes.
    pub tex_buffer_max_size: u64,
    /// Largest structured buffer binding, in bytes.
    pub uav_buffer_max_size: u64,
    /// Alignment that offsets and sizes of buffer writes and copies must honour.
    pub copy_alignment: u64,
    /// Whether buffers can stay mapped while the GPU reads them.
    pub supports_persistent_mapping: bool,
    /// Whether indirect-argument buffers can live on the GPU.
    pub supports_indirect_buffers: bool,
}

impl Default for BufferDeviceLimits {
    fn default() -> Self {
        Self {
            const_buffer_alignment: 256,
            tex_buffer_alignment: 256,
            uav_buffer_alignment: 256,
            const_buffer_max_size: 4 * 1024 * 1024,
            tex_buffer_max_size: 128 * 1024 * 1024,
            uav_buffer_max_size: 128 * 1024 * 1024,
            copy_alignment: 4,
            supports_persistent_mapping: false,
            supports_indirect_buffers: true,
        }
    }
}
