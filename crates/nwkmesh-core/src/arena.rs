//! Generation-checked slot arena
//!
//! Every network table is a fixed-capacity arena. A [`Handle`] embeds the
//! slot index and the generation the slot had when the value was inserted.
//! Freeing a slot bumps its generation, so a handle kept by a timer or a
//! pending transmission stops resolving once its slot is reused instead of
//! silently aliasing the new occupant.

use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{TableError, TableKind};

/// Opaque reference to a value stored in a [`SlotArena`]
pub struct Handle<T> {
    index: u16,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u16, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index, stable for the lifetime of the value
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity arena with generation-checked handles
#[derive(Debug)]
pub struct SlotArena<T> {
    kind: TableKind,
    slots: Vec<Slot<T>>,
    /// Freed slot indices, reused oldest first
    free: VecDeque<u16>,
    capacity: usize,
    len: usize,
}

impl<T> SlotArena<T> {
    /// Create an arena that never holds more than `capacity` values
    ///
    /// `kind` identifies the table in capacity errors.
    pub fn with_capacity(kind: TableKind, capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        Self {
            kind,
            slots: Vec::with_capacity(capacity),
            free: VecDeque::new(),
            capacity,
            len: 0,
        }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Store a value, failing when every slot is occupied
    pub fn insert(&mut self, value: T) -> Result<Handle<T>, TableError> {
        if self.is_full() {
            return Err(TableError::NoCapacity { table: self.kind });
        }

        let index = match self.free.pop_front() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u16
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.len += 1;
        Ok(Handle::new(index, slot.generation))
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Free the slot behind `handle`; stale handles are ignored
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(handle.index);
        self.len -= 1;
        Some(value)
    }

    /// Current handle of the value stored at `index`, if occupied
    pub fn handle_at(&self, index: usize) -> Option<Handle<T>> {
        let slot = self.slots.get(index)?;
        slot.value
            .as_ref()
            .map(|_| Handle::new(index as u16, slot.generation))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::new(i as u16, slot.generation), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|v| (Handle::new(i as u16, generation), v))
        })
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }

    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(h, _)| h).collect()
    }

    /// First handle whose value satisfies `pred`
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Handle<T>> {
        self.iter().find(|(_, v)| pred(v)).map(|(h, _)| h)
    }

    /// Keep values for which `keep` returns true, returning the removed ones
    pub fn retain(&mut self, mut keep: impl FnMut(&mut T) -> bool) -> Vec<T> {
        let doomed: Vec<Handle<T>> = self
            .iter_mut()
            .filter_map(|(h, v)| (!keep(v)).then_some(h))
            .collect();
        doomed.into_iter().filter_map(|h| self.remove(h)).collect()
    }

    pub fn clear(&mut self) {
        for handle in self.handles() {
            self.remove(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = SlotArena::with_capacity(TableKind::Routing, 4);
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();

        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_capacity_bound() {
        let mut arena = SlotArena::with_capacity(TableKind::Routing, 2);
        arena.insert(1).unwrap();
        arena.insert(2).unwrap();

        let err = arena.insert(3).unwrap_err();
        assert_eq!(
            err,
            TableError::NoCapacity {
                table: TableKind::Routing
            }
        );
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut arena = SlotArena::with_capacity(TableKind::Routing, 1);
        let old = arena.insert(10).unwrap();
        assert_eq!(arena.remove(old), Some(10));

        let new = arena.insert(20).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);

        assert!(arena.get(old).is_none());
        assert!(arena.remove(old).is_none());
        assert_eq!(arena.get(new), Some(&20));
    }

    #[test]
    fn test_free_slots_reused_oldest_first() {
        let mut arena = SlotArena::with_capacity(TableKind::Routing, 3);
        let a = arena.insert('a').unwrap();
        let b = arena.insert('b').unwrap();
        arena.insert('c').unwrap();

        arena.remove(b);
        arena.remove(a);

        let d = arena.insert('d').unwrap();
        assert_eq!(d.index(), b.index());
    }

    #[test]
    fn test_retain_returns_removed() {
        let mut arena = SlotArena::with_capacity(TableKind::Routing, 5);
        for i in 0..5 {
            arena.insert(i).unwrap();
        }
        let removed = arena.retain(|v| *v % 2 == 0);
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_handle_at() {
        let mut arena = SlotArena::with_capacity(TableKind::Routing, 2);
        let a = arena.insert(7).unwrap();
        assert_eq!(arena.handle_at(a.index()), Some(a));
        arena.remove(a);
        assert_eq!(arena.handle_at(a.index()), None);
    }
}
