//! Slot storage with generation-checked keys.
//!
//! Channels and members reference each other heavily, and timers reference all of them. Rather
//!  than sharing ownership, all of them live in [Arena]s and refer to each other by typed keys.
//!  Removing an entry bumps its slot's generation, so a key that outlives its entry (e.g. in a
//!  timer that fired after the member was torn down) resolves to `None` instead of aliasing
//!  whatever reuses the slot.

use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;

pub trait ArenaKey: Copy {
    fn from_parts(index: u32, generation: u32) -> Self;
    fn index(&self) -> u32;
    fn generation(&self) -> u32;
}

#[macro_export]
macro_rules! arena_key {
    ($name:ident) => {
        #[derive(Clone, Copy, Eq, PartialEq, Hash)]
        pub struct $name {
            index: u32,
            generation: u32,
        }
        impl $crate::util::arena::ArenaKey for $name {
            fn from_parts(index: u32, generation: u32) -> Self {
                $name { index, generation }
            }
            fn index(&self) -> u32 {
                self.index
            }
            fn generation(&self) -> u32 {
                self.generation
            }
        }
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({}v{})", stringify!($name), self.index, self.generation)
            }
        }
    }
}

struct Slot<V> {
    generation: u32,
    value: Option<V>,
}

pub struct Arena<K: ArenaKey, V> {
    slots: Vec<Slot<V>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: ArenaKey, V> Default for Arena<K, V> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }
}

impl<K: ArenaKey, V> Debug for Arena<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Arena{{len:{}}}", self.len)
    }
}

impl<K: ArenaKey, V> Arena<K, V> {
    pub fn insert(&mut self, value: V) -> K {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            K::from_parts(index, slot.generation)
        }
        else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, value: Some(value) });
            K::from_parts(index, 0)
        }
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.slots.get(key.index() as usize)
            .filter(|slot| slot.generation == key.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.slots.get_mut(key.index() as usize)
            .filter(|slot| slot.generation == key.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let slot = self.slots.get_mut(key.index() as usize)?;
        if slot.generation != key.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index());
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.iter()
            .map(|(k, _)| k)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.slots.iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.value.as_ref()
                .map(|v| (K::from_parts(index as u32, slot.generation), v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    arena_key!(TestKey);

    #[test]
    fn test_insert_get_remove() {
        let mut arena: Arena<TestKey, &str> = Arena::default();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_stale_key_after_slot_reuse() {
        let mut arena: Arena<TestKey, u32> = Arena::default();
        let old = arena.insert(1);
        arena.remove(old);
        let new = arena.insert(2);

        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.get(new), Some(&2));
        assert!(arena.get_mut(old).is_none());
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut arena: Arena<TestKey, u32> = Arena::default();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let c = arena.insert(3);
        arena.remove(b);

        assert_eq!(arena.keys(), vec![a, c]);
        assert_eq!(arena.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![1, 3]);
    }
}
