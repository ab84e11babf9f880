//! Fixed set of connection slots.
//!
//! Slots are allocated once. A free list hands out empty slots and every slot
//! carries a generation that is bumped on removal, so a handle to a removed
//! entry never reaches the entry that reuses the slot.

use crate::error::Error;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        // Lowest index is handed out first.
        let free = (0..capacity).rev().collect();
        Arena { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index and generation the next insert would use.
    pub fn vacant(&self) -> Result<(usize, u32), Error> {
        let index = *self.free.last().ok_or(Error::NoFreeSlot)?;
        Ok((index, self.slots[index].generation))
    }

    /// Insert into the slot reported by [`Arena::vacant`].
    pub fn insert(&mut self, value: T) -> Result<(usize, u32), Error> {
        let index = self.free.pop().ok_or(Error::NoFreeSlot)?;
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        Ok((index, slot.generation))
    }

    pub fn get(&self, index: usize, generation: u32) -> Option<&T> {
        let slot = self.slots.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, index: usize, generation: u32) -> Option<&mut T> {
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Remove the entry and invalidate its handle. Returns the entry and the
    /// slot's new generation.
    pub fn remove(&mut self, index: usize, generation: u32) -> Option<(T, u32)> {
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Some((value, slot.generation))
    }

    /// Occupied entries with their index and generation.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, u32, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.value.as_mut().map(|v| (i, s.generation, v)))
    }

    /// Entry at `index` regardless of generation.
    pub fn at_mut(&mut self, index: usize) -> Option<(u32, &mut T)> {
        let slot = self.slots.get_mut(index)?;
        let generation = slot.generation;
        slot.value.as_mut().map(|v| (generation, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_are_rejected() {
        let mut arena = Arena::with_capacity(2);
        let (i, g) = arena.insert("a").unwrap();
        assert_eq!((i, g), (0, 0));
        assert_eq!(arena.get(i, g), Some(&"a"));

        let (_, next) = arena.remove(i, g).unwrap();
        assert_eq!(next, 1);
        assert!(arena.get(i, g).is_none());
        assert!(arena.remove(i, g).is_none());

        let (i2, g2) = arena.insert("b").unwrap();
        assert_eq!((i2, g2), (0, 1));
        assert!(arena.get(i, g).is_none());
        assert_eq!(arena.get(i2, g2), Some(&"b"));
    }

    #[test]
    fn exhaustion() {
        let mut arena = Arena::with_capacity(1);
        assert_eq!(arena.vacant().unwrap(), (0, 0));
        arena.insert(1u8).unwrap();
        assert!(matches!(arena.vacant(), Err(Error::NoFreeSlot)));
        assert!(matches!(arena.insert(2), Err(Error::NoFreeSlot)));
        assert_eq!(arena.iter_mut().count(), 1);
        assert_eq!(arena.capacity(), 1);
    }
}
