//! Generational arena backing the object tree.
//!
//! Objects reference each other (parent link, child lists) through [`SlotId`]
//! values instead of owning pointers. Deleting an object bumps its slot's
//! generation, so any stale id held elsewhere misses on lookup instead of
//! aliasing a recycled slot.

use crate::object::ObjectEntry;

/// Generational index of an object slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<ObjectEntry>,
}

/// Slab of object slots with a free list.
#[derive(Debug, Default)]
pub(crate) struct ObjectArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ObjectArena {
    pub fn allocate(&mut self, entry: ObjectEntry) -> SlotId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.entry.is_none());
            slot.entry = Some(entry);
            return SlotId {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len()).expect("object arena exhausted u32 indices");
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        SlotId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&ObjectEntry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut ObjectEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Free the slot and return its entry. Stale or already-released ids
    /// return `None` (removal is idempotent).
    pub fn release(&mut self, id: SlotId) -> Option<ObjectEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(entry)
    }

    pub fn live(&self) -> usize {
        self.live
    }
}
