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

//! Generational slot storage backing every handle type of the buffer manager.

/// A slot index paired with a generation count.
///
/// When a slot is freed its index can be recycled, but the generation is incremented,
/// so stale handles pointing at a recycled index are rejected instead of silently
/// addressing the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaIndex {
    /// Position of the slot.
    pub index: u32,
    /// Incremented each time the slot is recycled.
    pub generation: u32,
}

/// Dense slot storage with index recycling through a free list.
#[derive(Debug, Clone)]
pub(crate) struct Arena<T> {
    slots: Vec<(ArenaIndex, Option<T>)>,
    freed: Vec<u32>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            freed: Vec::new(),
        }
    }

    /// Stores `value` in a recycled or new slot.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        if let Some(index) = self.freed.pop() {
            let (id, slot) = &mut self.slots[index as usize];
            id.generation = id.generation.wrapping_add(1);
            *slot = Some(value);
            *id
        } else {
            let id = ArenaIndex {
                index: self.slots.len() as u32,
                generation: 0,
            };
            self.slots.push((id, Some(value)));
            id
        }
    }

    pub fn get(&self, id: ArenaIndex) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .and_then(|(slot_id, value)| {
                if slot_id.generation == id.generation {
                    value.as_ref()
                } else {
                    None
                }
            })
    }

    pub fn get_mut(&mut self, id: ArenaIndex) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .and_then(|(slot_id, value)| {
                if slot_id.generation == id.generation {
                    value.as_mut()
                } else {
                    None
                }
            })
    }

    /// Takes the value out of its slot and queues the index for reuse.
    pub fn remove(&mut self, id: ArenaIndex) -> Option<T> {
        let (slot_id, value) = self.slots.get_mut(id.index as usize)?;
        if slot_id.generation != id.generation {
            return None;
        }
        let taken = value.take();
        if taken.is_some() {
            self.freed.push(id.index);
        }
        taken
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.slots.len() - self.freed.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.slots
            .iter()
            .filter_map(|(id, value)| value.as_ref().map(|v| (*id, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ArenaIndex, &mut T)> {
        self.slots
            .iter_mut()
            .filter_map(|(id, value)| value.as_mut().map(|v| (*id, v)))
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_slot_rejects_stale_index() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));

        let b = arena.insert("b");
        assert_eq!(b.index, a.index, "The freed slot should be recycled");
        assert_eq!(b.generation, a.generation + 1);
        assert!(arena.get(a).is_none(), "A stale index must not reach the new value");
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn double_remove_is_harmless() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let _b = arena.insert(2);
        assert_eq!(arena.remove(a), Some(1));
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.len(), 1);
    }
}
