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

//! Deduplication of vertex/index buffer binding combinations.

use super::arena::{Arena, ArenaIndex};
use khora_core::renderer::{
    BufferId, IndexFormat, PrimitiveTopology, VertexAttributeDescriptor, VertexStepMode,
};
use std::collections::HashMap;

/// One vertex buffer binding of a cached VAO.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    /// Device buffer of the pool holding the vertices.
    pub buffer: BufferId,
    /// Attribute layout of one element.
    pub attributes: Vec<VertexAttributeDescriptor>,
    /// Bytes between consecutive elements.
    pub stride: u64,
    /// Whether the binding advances per vertex or per instance.
    pub step_mode: VertexStepMode,
    /// Instances drawn per element for instanced bindings, 0 otherwise.
    pub instancing_divisor: u32,
}

/// The index buffer binding of a cached VAO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexBinding {
    /// Device buffer of the pool holding the indices.
    pub buffer: BufferId,
    /// Width of one index.
    pub format: IndexFormat,
}

/// Structural identity of a VAO.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaoKey {
    /// How vertices are assembled.
    pub topology: PrimitiveTopology,
    /// Index buffer, if the geometry is indexed.
    pub index: Option<IndexBinding>,
    /// Vertex buffer bindings, in slot order.
    pub vertex: Vec<VertexBinding>,
}

/// A reference into the [`VaoCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VaoSlot(ArenaIndex);

#[derive(Debug, Clone)]
struct VaoEntry {
    key: VaoKey,
    refcount: u32,
    vao_name: u32,
}

/// Reference-counted cache of VAO binding combinations.
///
/// Identical combinations share one entry. Every new entry gets a fresh name from a
/// monotonically increasing counter starting at 1; name 0 is reserved for placeholders.
#[derive(Debug, Default)]
pub struct VaoCache {
    entries: Arena<VaoEntry>,
    lookup: HashMap<VaoKey, VaoSlot>,
    next_vao_name: u32,
}

impl VaoCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `key`, creating it if needed, and takes one reference.
    pub fn find_or_create(&mut self, key: VaoKey) -> VaoSlot {
        if let Some(&slot) = self.lookup.get(&key) {
            if self.retain(slot) {
                return slot;
            }
        }

        self.next_vao_name = self.next_vao_name.wrapping_add(1).max(1);
        let slot = VaoSlot(self.entries.insert(VaoEntry {
            key: key.clone(),
            refcount: 1,
            vao_name: self.next_vao_name,
        }));
        self.lookup.insert(key, slot);
        slot
    }

    /// Like [`find_or_create`](Self::find_or_create), but the reference is dropped again
    /// unless the returned lease is kept.
    pub fn lease(&mut self, key: VaoKey) -> VaoLease<'_> {
        let slot = self.find_or_create(key);
        VaoLease {
            cache: self,
            slot: Some(slot),
        }
    }

    /// Takes one more reference on an existing entry.
    pub fn retain(&mut self, slot: VaoSlot) -> bool {
        match self.entries.get_mut(slot.0) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Drops one reference. The entry is erased when none are left.
    ///
    /// Returns `true` if the entry was erased.
    pub fn release(&mut self, slot: VaoSlot) -> bool {
        let Some(entry) = self.entries.get_mut(slot.0) else {
            debug_assert!(false, "Releasing an unknown VAO slot");
            return false;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return false;
        }
        if let Some(entry) = self.entries.remove(slot.0) {
            self.lookup.remove(&entry.key);
        }
        true
    }

    /// The name of the entry, used to derive render-queue sort keys.
    pub fn vao_name(&self, slot: VaoSlot) -> Option<u32> {
        self.entries.get(slot.0).map(|e| e.vao_name)
    }

    /// Current reference count of the entry.
    pub fn refcount(&self, slot: VaoSlot) -> u32 {
        self.entries.get(slot.0).map_or(0, |e| e.refcount)
    }

    /// The binding combination of the entry.
    pub fn key(&self, slot: VaoSlot) -> Option<&VaoKey> {
        self.entries.get(slot.0).map(|e| &e.key)
    }

    /// Number of distinct live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entry is alive.
    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }

    /// Forgets every entry, as after device loss. Names keep increasing.
    pub fn clear(&mut self) {
        self.entries = Arena::new();
        self.lookup.clear();
    }
}

/// A scoped reference to a cache entry.
///
/// Dropping the lease releases the reference; [`VaoLease::keep`] hands it over instead.
#[derive(Debug)]
pub struct VaoLease<'a> {
    cache: &'a mut VaoCache,
    slot: Option<VaoSlot>,
}

impl VaoLease<'_> {
    /// The leased entry.
    pub fn slot(&self) -> Option<VaoSlot> {
        self.slot
    }

    /// Name of the leased entry.
    pub fn vao_name(&self) -> u32 {
        self.slot
            .and_then(|slot| self.cache.vao_name(slot))
            .unwrap_or(0)
    }

    /// Keeps the reference alive past the lease.
    pub fn keep(mut self) -> Option<VaoSlot> {
        self.slot.take()
    }
}

impl Drop for VaoLease<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.cache.release(slot);
        }
    }
}
