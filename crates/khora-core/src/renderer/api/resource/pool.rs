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

//! Buffer categories used to bucket allocations into pools.

/// The kind of physical buffer object a pool is made of.
///
/// Constant, texture, UAV and indirect buffers all share the `Shader` pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InternalBufferType {
    /// Pools bound as vertex buffers.
    Vertex,
    /// Pools bound as index buffers.
    Index,
    /// Pools bound to shaders (uniform, storage, texel or indirect-argument buffers).
    Shader,
}

impl InternalBufferType {
    /// Every internal type, in bucket order.
    pub const ALL: [InternalBufferType; 3] = [
        InternalBufferType::Vertex,
        InternalBufferType::Index,
        InternalBufferType::Shader,
    ];

    /// Returns the bucket index of this type.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the upper-case name used in configuration keys and statistics.
    pub const fn name(self) -> &'static str {
        match self {
            InternalBufferType::Vertex => "VERTEX",
            InternalBufferType::Index => "INDEX",
            InternalBufferType::Shader => "SHADER",
        }
    }
}

/// The usage bucket a pool belongs to.
///
/// Every [`BufferType`] maps onto exactly one category; all dynamic flavours share
/// the [`PoolCategory::Dynamic`] bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolCategory {
    /// Created once with data, never written again.
    Immutable,
    /// GPU-resident, updated through uploads.
    Default,
    /// Same as `Default`, but meant to be shared with other devices or contexts.
    DefaultShared,
    /// CPU-writable, N-buffered to avoid write-after-read hazards.
    Dynamic,
}

impl PoolCategory {
    /// Every category, in bucket order.
    pub const ALL: [PoolCategory; 4] = [
        PoolCategory::Immutable,
        PoolCategory::Default,
        PoolCategory::DefaultShared,
        PoolCategory::Dynamic,
    ];

    /// Returns the bucket index of this category.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the upper-case name used in configuration keys and statistics.
    pub const fn name(self) -> &'static str {
        match self {
            PoolCategory::Immutable => "IMMUTABLE",
            PoolCategory::Default => "DEFAULT",
            PoolCategory::DefaultShared => "SHARED",
            PoolCategory::Dynamic => "DYNAMIC",
        }
    }
}

/// The usage requested by the client when creating a logical buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferType {
    /// Read-only for the GPU; the data is supplied at creation and can never change.
    Immutable,
    /// GPU read/write; the CPU can only upload through staging copies.
    #[default]
    Default,
    /// Like `Default`, shareable between contexts.
    DefaultShared,
    /// CPU write-only, GPU read-only. Multi-buffered.
    DynamicDefault,
    /// Requested with persistent mapping, emulated with `DynamicDefault` semantics.
    DynamicPersistent,
    /// Requested with coherent persistent mapping, emulated with `DynamicDefault` semantics.
    DynamicPersistentCoherent,
}

impl BufferType {
    /// Returns the pool bucket serving this buffer type.
    pub const fn pool_category(self) -> PoolCategory {
        match self {
            BufferType::Immutable => PoolCategory::Immutable,
            BufferType::Default => PoolCategory::Default,
            BufferType::DefaultShared => PoolCategory::DefaultShared,
            BufferType::DynamicDefault
            | BufferType::DynamicPersistent
            | BufferType::DynamicPersistentCoherent => PoolCategory::Dynamic,
        }
    }

    /// Returns `true` for every dynamic flavour.
    pub const fn is_dynamic(self) -> bool {
        matches!(self.pool_category(), PoolCategory::Dynamic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_flavours_share_one_bucket() {
        assert_eq!(
            BufferType::DynamicPersistent.pool_category(),
            PoolCategory::Dynamic
        );
        assert_eq!(
            BufferType::DynamicPersistentCoherent.pool_category(),
            BufferType::DynamicDefault.pool_category()
        );
        assert!(!BufferType::DefaultShared.is_dynamic());
    }

    #[test]
    fn bucket_indices_are_dense() {
        for (i, ty) in InternalBufferType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
        for (i, category) in PoolCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
    }
}
