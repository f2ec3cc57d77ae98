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

//! Introspection of pool occupancy.

use super::pool::{PoolKey, PoolSet};

/// One used or free extent of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStatsEntry {
    /// Bucket of the pool.
    pub pool_key: PoolKey,
    /// Index of the pool inside its bucket.
    pub pool_index: usize,
    /// Start of the extent.
    pub offset: u64,
    /// Length of the extent.
    pub size_bytes: u64,
    /// Total size of the pool.
    pub pool_capacity: u64,
    /// Whether the extent is free.
    pub is_free: bool,
}

/// A snapshot of every pool, produced by `GpuBufferManager::memory_stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Extents in offset order within each pool.
    pub entries: Vec<MemoryStatsEntry>,
    /// Sum of all pool capacities.
    pub total_capacity_bytes: u64,
    /// Bytes in free extents.
    pub free_bytes: u64,
    /// Bytes in used extents, padding included.
    pub used_bytes: u64,
}

impl MemoryStats {
    pub(crate) fn collect(pools: &PoolSet) -> Self {
        let mut stats = MemoryStats::default();
        for (pool_key, pool_index, pool) in pools.iter() {
            if pool.released {
                continue;
            }
            let capacity = pool.size_bytes;
            stats.total_capacity_bytes += capacity;

            let mut free: Vec<_> = pool.free_list.blocks().to_vec();
            free.sort_by_key(|b| b.offset);

            let mut push = |offset: u64, size_bytes: u64, is_free: bool| {
                stats.entries.push(MemoryStatsEntry {
                    pool_key,
                    pool_index,
                    offset,
                    size_bytes,
                    pool_capacity: capacity,
                    is_free,
                });
            };

            let mut cursor = 0;
            for block in &free {
                if block.offset > cursor {
                    push(cursor, block.offset - cursor, false);
                }
                push(block.offset, block.size, true);
                cursor = block.end();
            }
            if cursor < capacity {
                push(cursor, capacity - cursor, false);
            }
        }

        for entry in &stats.entries {
            if entry.is_free {
                stats.free_bytes += entry.size_bytes;
            } else {
                stats.used_bytes += entry.size_bytes;
            }
        }
        stats
    }

    /// Textual name of a bucket, such as `VERTEX_IMMUTABLE`.
    pub fn pool_type_name(key: PoolKey) -> String {
        key.name()
    }

    /// Renders the entries as CSV, one line per extent after a header line.
    ///
    /// `pool_id` is the bucket packed by [`PoolKey::encoded`].
    pub fn to_csv(&self) -> String {
        let mut csv =
            String::from("pool_type,pool_id,pool_index,offset,size_bytes,pool_capacity,is_free\n");
        for e in &self.entries {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{}\n",
                Self::pool_type_name(e.pool_key),
                e.pool_key.encoded(),
                e.pool_index,
                e.offset,
                e.size_bytes,
                e.pool_capacity,
                e.is_free
            ));
        }
        csv
    }
}
