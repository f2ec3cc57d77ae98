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

//! Pools: large device buffers sub-allocated by the manager.

use super::block::{FreeList, StrideChangerList};
use khora_core::renderer::{BufferId, InternalBufferType, PoolCategory, ResourceError};

/// Identifies a pool bucket: one internal buffer type crossed with one pool category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    /// What the pool's buffer is bound as.
    pub internal: InternalBufferType,
    /// How the pool is updated.
    pub category: PoolCategory,
}

impl PoolKey {
    /// Creates a bucket key.
    pub const fn new(internal: InternalBufferType, category: PoolCategory) -> Self {
        Self { internal, category }
    }

    /// Packs the key as `(internal << 16) | category`, the form used in statistics dumps.
    pub const fn encoded(&self) -> u32 {
        ((self.internal.index() as u32) << 16) | self.category.index() as u32
    }

    /// Name of the bucket, e.g. `VERTEX_IMMUTABLE`.
    pub fn name(&self) -> String {
        format!("{}_{}", self.internal.name(), self.category.name())
    }

    /// Every bucket, in `(internal, category)` order.
    pub fn all() -> impl Iterator<Item = PoolKey> {
        InternalBufferType::ALL.into_iter().flat_map(|internal| {
            PoolCategory::ALL
                .into_iter()
                .map(move |category| PoolKey::new(internal, category))
        })
    }
}

/// A byte range of a pool that is currently mapped for CPU writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MappedRegion {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// CPU-side write helper of a dynamic pool.
///
/// Dynamic pools are written through staging memory owned here and flushed to the
/// device on unmap. Two mapped regions of the same pool may never overlap.
#[derive(Debug, Clone, Default)]
pub(crate) struct DynamicRing {
    mapped: Vec<MappedRegion>,
}

impl DynamicRing {
    /// Maps `[offset, offset + initial.len())`, seeding it with `initial`.
    pub fn map(&mut self, offset: u64, initial: Vec<u8>) -> Result<&mut [u8], ResourceError> {
        let end = offset + initial.len() as u64;
        if self
            .mapped
            .iter()
            .any(|r| offset < r.offset + r.data.len() as u64 && r.offset < end)
        {
            return Err(ResourceError::InvalidArgument(format!(
                "range {offset}..{end} is already mapped"
            )));
        }
        self.mapped.push(MappedRegion {
            offset,
            data: initial,
        });
        let last = self.mapped.len() - 1;
        Ok(self.mapped[last].data.as_mut_slice())
    }

    /// Ends the mapping that starts at `offset` and hands its bytes back for upload.
    pub fn unmap(&mut self, offset: u64) -> Option<MappedRegion> {
        let index = self.mapped.iter().position(|r| r.offset == offset)?;
        Some(self.mapped.swap_remove(index))
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped.len()
    }

    pub fn discard_all(&mut self) {
        self.mapped.clear();
    }
}

/// One device buffer and the bookkeeping of the space inside it.
#[derive(Debug, Clone)]
pub(crate) struct Pool {
    /// The device buffer. `None` after device loss or once an immutable pool was released.
    pub buffer: Option<BufferId>,
    pub size_bytes: u64,
    pub free_list: FreeList,
    pub stride_changers: StrideChangerList,
    pub dynamic_ring: Option<DynamicRing>,
    /// Set once an immutable pool became empty and gave its buffer back.
    pub released: bool,
}

impl Pool {
    fn new(buffer: BufferId, size_bytes: u64, category: PoolCategory) -> Self {
        Self {
            buffer: Some(buffer),
            size_bytes,
            free_list: FreeList::empty_pool(size_bytes),
            stride_changers: StrideChangerList::default(),
            dynamic_ring: (category == PoolCategory::Dynamic).then(DynamicRing::default),
            released: false,
        }
    }

    pub fn is_fully_free(&self) -> bool {
        self.free_list.spans(self.size_bytes)
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_list.free_bytes()
    }
}

/// Result of a successful sub-allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub pool_index: usize,
    pub offset: u64,
}

/// All pools, bucketed by [`PoolKey`].
#[derive(Debug, Clone)]
pub(crate) struct PoolSet {
    buckets: [[Vec<Pool>; 4]; 3],
}

impl PoolSet {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
        }
    }

    pub fn bucket(&self, key: PoolKey) -> &[Pool] {
        &self.buckets[key.internal.index()][key.category.index()]
    }

    fn bucket_mut(&mut self, key: PoolKey) -> &mut Vec<Pool> {
        &mut self.buckets[key.internal.index()][key.category.index()]
    }

    pub fn pool(&self, key: PoolKey, pool_index: usize) -> Option<&Pool> {
        self.bucket(key).get(pool_index)
    }

    pub fn pool_mut(&mut self, key: PoolKey, pool_index: usize) -> Option<&mut Pool> {
        self.bucket_mut(key).get_mut(pool_index)
    }

    /// Iterates every pool with its bucket and index.
    pub fn iter(&self) -> impl Iterator<Item = (PoolKey, usize, &Pool)> {
        PoolKey::all().flat_map(move |key| {
            self.bucket(key)
                .iter()
                .enumerate()
                .map(move |(index, pool)| (key, index, pool))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PoolKey, &mut Pool)> {
        self.buckets.iter_mut().enumerate().flat_map(|(i, row)| {
            row.iter_mut().enumerate().flat_map(move |(j, pools)| {
                let key = PoolKey::new(InternalBufferType::ALL[i], PoolCategory::ALL[j]);
                pools.iter_mut().map(move |pool| (key, pool))
            })
        })
    }

    /// Reserves `size` bytes at `alignment` in the `key` bucket.
    ///
    /// Searches every pool of the bucket. A block needing no padding is taken at once,
    /// otherwise the last acceptable block seen is used. When nothing fits, a new pool of
    /// `max(default_pool_size, size)` bytes is created through `create_buffer`; the pool is
    /// only registered if that call succeeds.
    pub fn allocate(
        &mut self,
        key: PoolKey,
        size: u64,
        alignment: u64,
        default_pool_size: u64,
        create_buffer: impl FnOnce(u64) -> Result<BufferId, ResourceError>,
    ) -> Result<Allocation, ResourceError> {
        debug_assert!(alignment > 0);
        debug_assert!(
            key.category != PoolCategory::Immutable,
            "Immutable buffers are only placed by the batcher"
        );

        let bucket = self.bucket_mut(key);
        let mut best = None;
        for (pool_index, pool) in bucket.iter().enumerate() {
            if pool.released {
                continue;
            }
            if let Some(fit) = pool.free_list.find_fit(size, alignment) {
                best = Some((pool_index, fit));
                if fit.padding == 0 {
                    break;
                }
            }
        }

        let (pool_index, fit) = match best {
            Some(found) => found,
            None => {
                let pool_size = default_pool_size.max(size);
                let buffer = create_buffer(pool_size)?;
                bucket.push(Pool::new(buffer, pool_size, key.category));
                let pool_index = bucket.len() - 1;
                log::debug!(
                    "Created {} pool #{pool_index} of {pool_size} bytes",
                    key.name()
                );
                let fit = bucket[pool_index]
                    .free_list
                    .find_fit(size, alignment)
                    .ok_or(ResourceError::OutOfBounds)?;
                (pool_index, fit)
            }
        };

        let pool = &mut bucket[pool_index];
        pool.free_list.consume(fit, size);
        if fit.padding != 0 {
            pool.stride_changers.insert(fit.padded_offset, fit.padding);
        }

        Ok(Allocation {
            pool_index,
            offset: fit.padded_offset,
        })
    }

    /// Registers an already filled pool, as produced by the immutable batcher.
    pub fn push_full(
        &mut self,
        key: PoolKey,
        buffer: BufferId,
        size_bytes: u64,
        stride_changers: StrideChangerList,
    ) -> usize {
        let bucket = self.bucket_mut(key);
        bucket.push(Pool {
            buffer: Some(buffer),
            size_bytes,
            free_list: FreeList::full(),
            stride_changers,
            dynamic_ring: None,
            released: false,
        });
        bucket.len() - 1
    }

    /// Gives `[offset, offset + size)` back to its pool.
    ///
    /// Padding recorded in front of `offset` is folded back in. Returns the device buffers
    /// that must be destroyed: an immutable pool is released as soon as it is entirely free,
    /// and trailing released pools are popped so the bucket stays dense.
    pub fn deallocate(
        &mut self,
        key: PoolKey,
        pool_index: usize,
        offset: u64,
        size: u64,
    ) -> Result<Vec<BufferId>, ResourceError> {
        let bucket = self.bucket_mut(key);
        let Some(pool) = bucket.get_mut(pool_index) else {
            debug_assert!(false, "No pool #{pool_index} in {}", key.name());
            return Err(ResourceError::InvalidHandle);
        };
        if offset + size > pool.size_bytes {
            debug_assert!(false, "Freeing past the end of {} pool #{pool_index}", key.name());
            return Err(ResourceError::InvalidArgument(format!(
                "range {offset}+{size} exceeds pool of {} bytes",
                pool.size_bytes
            )));
        }

        let padding = pool.stride_changers.take(offset).unwrap_or(0);
        let start = offset - padding;
        let length = size + padding;
        if pool.free_list.overlaps(start, length) {
            debug_assert!(false, "Double free in {} pool #{pool_index}", key.name());
            return Err(ResourceError::InvalidArgument(format!(
                "range {start}+{length} is already free"
            )));
        }
        pool.free_list.release(start, length);

        let mut released = Vec::new();
        if key.category == PoolCategory::Immutable && pool.is_fully_free() {
            pool.released = true;
            released.extend(pool.buffer.take());
            if pool_index == bucket.len() - 1 {
                while bucket.last().is_some_and(|p| p.released) {
                    bucket.pop();
                }
            }
        }
        Ok(released)
    }

    /// Removes every fully free or released pool.
    ///
    /// Removal swaps with the bucket's last pool; `rehome(key, from, to)` is invoked so that
    /// live buffers pointing at the moved pool can be updated. Buffers of removed pools are
    /// handed to `release`.
    pub fn cleanup_empty(
        &mut self,
        mut rehome: impl FnMut(PoolKey, usize, usize),
        mut release: impl FnMut(BufferId),
    ) -> usize {
        let mut removed = 0;
        for key in PoolKey::all() {
            let bucket = self.bucket_mut(key);
            let mut index = 0;
            while index < bucket.len() {
                let pool = &mut bucket[index];
                if pool.released || pool.is_fully_free() {
                    if let Some(buffer) = pool.buffer.take() {
                        release(buffer);
                    }
                    let last = bucket.len() - 1;
                    bucket.swap_remove(index);
                    if index != last {
                        rehome(key, last, index);
                    }
                    removed += 1;
                } else {
                    index += 1;
                }
            }
        }
        removed
    }
}

impl Default for PoolSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::block::Block;
    use super::*;

    const VERTEX_DEFAULT: PoolKey = PoolKey::new(InternalBufferType::Vertex, PoolCategory::Default);
    const INDEX_IMMUTABLE: PoolKey =
        PoolKey::new(InternalBufferType::Index, PoolCategory::Immutable);

    fn counter_device() -> impl FnMut(u64) -> Result<BufferId, ResourceError> {
        let mut next = 0;
        move |_size| {
            next += 1;
            Ok(BufferId(next))
        }
    }

    fn assert_accounting(set: &PoolSet, key: PoolKey, live: &[(usize, u64)]) {
        for (index, pool) in set.bucket(key).iter().enumerate() {
            let live_bytes: u64 = live.iter().filter(|(p, _)| *p == index).map(|(_, s)| s).sum();
            assert_eq!(
                pool.free_bytes() + live_bytes + pool.stride_changers.padded_bytes(),
                pool.size_bytes,
                "Pool #{index} leaks or double counts bytes"
            );
        }
    }

    #[test]
    fn new_pool_uses_default_size_or_request() {
        let mut set = PoolSet::new();
        let mut create = counter_device();

        let a = set.allocate(VERTEX_DEFAULT, 100, 4, 1024, &mut create).unwrap();
        assert_eq!(a, Allocation { pool_index: 0, offset: 0 });
        assert_eq!(set.bucket(VERTEX_DEFAULT)[0].size_bytes, 1024);

        let big = set.allocate(VERTEX_DEFAULT, 4096, 4, 1024, &mut create).unwrap();
        assert_eq!(big.pool_index, 1);
        assert_eq!(set.bucket(VERTEX_DEFAULT)[1].size_bytes, 4096);
    }

    #[test]
    fn round_trip_with_padding_restores_free_list() {
        let mut set = PoolSet::new();
        let mut create = counter_device();
        // Misalign the free block: [0, 3) used, [3, 1024) free.
        let first = set.allocate(VERTEX_DEFAULT, 3, 1, 1024, &mut create).unwrap();
        let before = set.bucket(VERTEX_DEFAULT)[0].free_list.clone();

        let padded = set.allocate(VERTEX_DEFAULT, 64, 16, 1024, &mut create).unwrap();
        assert_eq!(padded.offset, 16);
        assert_accounting(&set, VERTEX_DEFAULT, &[(0, 3), (0, 64)]);

        set.deallocate(VERTEX_DEFAULT, padded.pool_index, padded.offset, 64)
            .unwrap();
        let after = &set.bucket(VERTEX_DEFAULT)[0];
        assert_eq!(after.free_list, before);
        assert!(after.stride_changers.is_empty());

        set.deallocate(VERTEX_DEFAULT, first.pool_index, first.offset, 3)
            .unwrap();
        assert!(set.bucket(VERTEX_DEFAULT)[0].is_fully_free());
    }

    #[test]
    fn zero_padding_block_preferred_across_pools() {
        let mut set = PoolSet::new();
        let mut create = counter_device();
        // Pool 0: [0,1) used, rest free and misaligned for 8-byte strides.
        set.allocate(VERTEX_DEFAULT, 1, 1, 256, &mut create).unwrap();
        // Pool 1: filled by a request too large for pool 0, then freed on an aligned boundary.
        let filler = set.allocate(VERTEX_DEFAULT, 256, 1, 256, &mut create).unwrap();
        assert_eq!(filler.pool_index, 1);
        set.deallocate(VERTEX_DEFAULT, 1, 0, 256).unwrap();

        let hit = set.allocate(VERTEX_DEFAULT, 32, 8, 256, &mut create).unwrap();
        assert_eq!(hit, Allocation { pool_index: 1, offset: 0 });
        assert!(set.bucket(VERTEX_DEFAULT)[1].stride_changers.is_empty());
    }

    #[test]
    fn failed_pool_creation_registers_nothing() {
        let mut set = PoolSet::new();
        let result = set.allocate(VERTEX_DEFAULT, 64, 4, 128, |size| {
            Err(ResourceError::OutOfDeviceMemory {
                requested_bytes: size,
            })
        });
        assert_eq!(
            result,
            Err(ResourceError::OutOfDeviceMemory {
                requested_bytes: 128
            })
        );
        assert!(set.bucket(VERTEX_DEFAULT).is_empty());
    }

    #[test]
    fn immutable_pool_released_when_empty() {
        let mut set = PoolSet::new();
        set.push_full(INDEX_IMMUTABLE, BufferId(7), 100, StrideChangerList::default());

        let released = set.deallocate(INDEX_IMMUTABLE, 0, 0, 50).unwrap();
        assert!(released.is_empty());
        assert_eq!(set.bucket(INDEX_IMMUTABLE).len(), 1);

        let released = set.deallocate(INDEX_IMMUTABLE, 0, 50, 50).unwrap();
        assert_eq!(released, vec![BufferId(7)]);
        assert!(set.bucket(INDEX_IMMUTABLE).is_empty());
    }

    #[test]
    fn released_middle_pool_waits_for_trailing_pop() {
        let mut set = PoolSet::new();
        set.push_full(INDEX_IMMUTABLE, BufferId(1), 16, StrideChangerList::default());
        set.push_full(INDEX_IMMUTABLE, BufferId(2), 16, StrideChangerList::default());

        set.deallocate(INDEX_IMMUTABLE, 0, 0, 16).unwrap();
        assert_eq!(set.bucket(INDEX_IMMUTABLE).len(), 2, "Index 0 is not trailing");

        set.deallocate(INDEX_IMMUTABLE, 1, 0, 16).unwrap();
        assert!(set.bucket(INDEX_IMMUTABLE).is_empty());
    }

    #[test]
    fn unknown_pool_index_leaves_other_pools_untouched() {
        let mut set = PoolSet::new();
        let mut create = counter_device();
        set.allocate(VERTEX_DEFAULT, 16, 4, 64, &mut create).unwrap();
        let snapshot = set.bucket(VERTEX_DEFAULT)[0].free_list.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            set.deallocate(VERTEX_DEFAULT, 5, 0, 16)
        }));
        if let Ok(result) = result {
            assert_eq!(result, Err(ResourceError::InvalidHandle));
        }
        assert_eq!(set.bucket(VERTEX_DEFAULT)[0].free_list, snapshot);
    }

    #[test]
    fn cleanup_rehomes_moved_pools() {
        let mut set = PoolSet::new();
        let mut create = counter_device();
        set.allocate(VERTEX_DEFAULT, 64, 4, 64, &mut create).unwrap();
        set.allocate(VERTEX_DEFAULT, 64, 4, 64, &mut create).unwrap();
        set.allocate(VERTEX_DEFAULT, 64, 4, 64, &mut create).unwrap();
        set.deallocate(VERTEX_DEFAULT, 0, 0, 64).unwrap();

        let mut moves = Vec::new();
        let mut released = Vec::new();
        let removed = set.cleanup_empty(
            |key, from, to| moves.push((key, from, to)),
            |buffer| released.push(buffer),
        );

        assert_eq!(removed, 1);
        assert_eq!(moves, vec![(VERTEX_DEFAULT, 2, 0)]);
        assert_eq!(released, vec![BufferId(1)]);
        assert_eq!(set.bucket(VERTEX_DEFAULT).len(), 2);
        assert_eq!(set.bucket(VERTEX_DEFAULT)[0].buffer, Some(BufferId(3)));
        assert_eq!(
            set.bucket(VERTEX_DEFAULT)[0].free_list.blocks(),
            &[] as &[Block]
        );
    }

    #[test]
    fn dynamic_ring_rejects_overlapping_maps() {
        let mut ring = DynamicRing::default();
        ring.map(0, vec![0; 16]).unwrap();
        assert!(ring.map(8, vec![0; 16]).is_err());
        ring.map(16, vec![0; 16]).unwrap();

        let region = ring.unmap(0).unwrap();
        assert_eq!(region.data.len(), 16);
        assert_eq!(ring.mapped_count(), 1);
    }

    #[test]
    fn pool_key_encoding() {
        let key = PoolKey::new(InternalBufferType::Shader, PoolCategory::Dynamic);
        assert_eq!(key.encoded(), (2 << 16) | 3);
        assert_eq!(key.name(), "SHADER_DYNAMIC");
        assert_eq!(PoolKey::all().count(), 12);
    }
}
