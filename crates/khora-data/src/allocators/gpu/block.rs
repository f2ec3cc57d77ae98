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

//! Free-space bookkeeping inside a single pool.
//!
//! Blocks and stride changers are plain values stored in vectors and addressed by
//! index. Removal from the free list swaps with the last element, so callers must
//! never hold on to a block index across a mutation, and must never depend on the
//! order of the free list.

use khora_core::renderer::api::align_to_next;

/// A contiguous free byte range inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block {
    /// Byte offset of the range from the start of the pool.
    pub offset: u64,
    /// Length of the range in bytes.
    pub size: u64,
}

impl Block {
    /// Creates a block.
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// One past the last byte of the range.
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Records that `padded_bytes` were skipped right before `offset` to honour alignment.
///
/// Keyed by the post-padding offset, which is also the start of the allocation the
/// padding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrideChanger {
    /// Start of the aligned allocation.
    pub offset: u64,
    /// Bytes inserted in front of it.
    pub padded_bytes: u64,
}

/// Where a request fits inside a free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockFit {
    pub block_index: usize,
    pub padded_offset: u64,
    pub padding: u64,
}

/// The unordered set of free blocks of a pool.
///
/// After every insertion through [`FreeList::release`] no two blocks touch or overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeList {
    blocks: Vec<Block>,
}

impl FreeList {
    /// A free list with no free space, as for a freshly filled immutable pool.
    pub fn full() -> Self {
        Self { blocks: Vec::new() }
    }

    /// A free list covering `[0, size)`.
    pub fn empty_pool(size: u64) -> Self {
        Self {
            blocks: vec![Block::new(0, size)],
        }
    }

    /// The free blocks, in no particular order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum()
    }

    /// Returns `true` if a single block spans the whole `[0, pool_size)` range.
    pub fn spans(&self, pool_size: u64) -> bool {
        self.blocks.len() == 1 && self.blocks[0].offset == 0 && self.blocks[0].size == pool_size
    }

    /// Returns `true` if `[offset, offset + size)` overlaps any free block.
    pub fn overlaps(&self, offset: u64, size: u64) -> bool {
        let end = offset + size;
        self.blocks.iter().any(|b| offset < b.end() && b.offset < end)
    }

    /// Looks for a block able to hold `size` bytes at `alignment`.
    ///
    /// A block needing no padding wins immediately. Otherwise the last acceptable
    /// block in iteration order is returned.
    pub(crate) fn find_fit(&self, size: u64, alignment: u64) -> Option<BlockFit> {
        let mut best = None;
        for (block_index, block) in self.blocks.iter().enumerate() {
            let padded_offset = align_to_next(block.offset, alignment);
            let padding = padded_offset - block.offset;
            if size + padding <= block.size {
                let fit = BlockFit {
                    block_index,
                    padded_offset,
                    padding,
                };
                if padding == 0 {
                    return Some(fit);
                }
                best = Some(fit);
            }
        }
        best
    }

    /// Carves `size` bytes out of the block described by `fit`.
    ///
    /// The block shrinks from the front; it is removed once nothing is left.
    pub(crate) fn consume(&mut self, fit: BlockFit, size: u64) {
        let block = &mut self.blocks[fit.block_index];
        block.size -= size + fit.padding;
        block.offset = fit.padded_offset + size;
        if block.size == 0 {
            self.blocks.swap_remove(fit.block_index);
        }
    }

    /// Returns a range to the free list and coalesces it with its neighbours.
    ///
    /// Zero-sized ranges are ignored.
    pub fn release(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.blocks.push(Block::new(offset, size));
        let last = self.blocks.len() - 1;
        self.merge_adjacent(last);
    }

    /// Merges the block at `target` with every block touching it.
    ///
    /// Restarts the scan after each merge since removal reorders the list.
    /// Returns the final index of the merged block.
    fn merge_adjacent(&mut self, mut target: usize) -> usize {
        let mut i = 0;
        while i < self.blocks.len() {
            if i == target {
                i += 1;
                continue;
            }
            let current = self.blocks[target];
            let other = self.blocks[i];
            if other.end() == current.offset {
                // `other` absorbs `current`.
                self.blocks[i].size += current.size;
                let last = self.blocks.len() - 1;
                self.blocks.swap_remove(target);
                target = if i == last { target } else { i };
                i = 0;
            } else if current.end() == other.offset {
                self.blocks[target].size += other.size;
                let last = self.blocks.len() - 1;
                self.blocks.swap_remove(i);
                if target == last {
                    target = i;
                }
                i = 0;
            } else {
                i += 1;
            }
        }
        target
    }
}

/// Padding records of a pool, kept sorted by offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrideChangerList {
    entries: Vec<StrideChanger>,
}

impl StrideChangerList {
    /// Builds a list from records, sorting them by offset.
    pub fn from_unsorted(mut entries: Vec<StrideChanger>) -> Self {
        entries.sort_by_key(|e| e.offset);
        Self { entries }
    }

    /// Records padding in front of the allocation starting at `offset`.
    pub fn insert(&mut self, offset: u64, padded_bytes: u64) {
        let changer = StrideChanger {
            offset,
            padded_bytes,
        };
        match self.entries.binary_search_by_key(&offset, |e| e.offset) {
            Ok(existing) => {
                debug_assert!(false, "Duplicate stride changer at offset {offset}");
                self.entries[existing] = changer;
            }
            Err(position) => self.entries.insert(position, changer),
        }
    }

    /// Removes and returns the padding recorded at exactly `offset`, if any.
    pub fn take(&mut self, offset: u64) -> Option<u64> {
        self.entries
            .binary_search_by_key(&offset, |e| e.offset)
            .ok()
            .map(|index| self.entries.remove(index).padded_bytes)
    }

    /// Total padding bytes currently recorded.
    pub fn padded_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.padded_bytes).sum()
    }

    /// The records, sorted by offset.
    pub fn entries(&self) -> &[StrideChanger] {
        &self.entries
    }

    /// Returns `true` if no padding is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
