//! Generation-tagged slot arena.
//!
//! A slot's generation is bumped each time it is vacated, so a [`Key`] held
//! across a removal can never address the value that later reuses the slot.

use serde::{Deserialize, Serialize};

use crate::error::{AvailError, AvailResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Bounded slot map. Inserting past `capacity` fails with `TableFull`.
#[derive(Debug)]
pub struct Arena<T> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
    capacity: usize,
}

impl<T> Arena<T> {
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: Vec::new(),
            free_head: None,
            len: 0,
            capacity,
        }
    }

    pub fn insert(&mut self, value: T) -> AvailResult<Key> {
        if self.len >= self.capacity {
            return Err(AvailError::TableFull {
                table: self.name,
                capacity: self.capacity,
            });
        }

        let key = match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let (generation, next_free) = match slot {
                    Slot::Vacant { generation, next_free } => (*generation, *next_free),
                    Slot::Occupied { .. } => {
                        return Err(AvailError::failed(format!(
                            "{} arena free list points at occupied slot {}",
                            self.name, index
                        )));
                    }
                };
                *slot = Slot::Occupied { generation, value };
                self.free_head = next_free;
                Key { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied { generation: 0, value });
                Key { index, generation: 0 }
            }
        };
        self.len += 1;
        Ok(key)
    }

    pub fn get(&self, key: Key) -> Option<&T> {
        match self.slots.get(key.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == key.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        match self.slots.get_mut(key.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == key.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    /// Remove the value at `key`. Stale keys return `None`.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        match &*slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            generation: key.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let old = std::mem::replace(slot, vacant);
        self.free_head = Some(key.index);
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, value } => Some((
                Key {
                    index: index as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_past_capacity_is_table_full() {
        let mut arena = Arena::with_capacity("alarms", 2);
        arena.insert(1).unwrap();
        arena.insert(2).unwrap();
        let err = arena.insert(3).unwrap_err();
        assert!(matches!(err, AvailError::TableFull { table: "alarms", capacity: 2 }));
    }

    #[test]
    fn stale_key_does_not_alias_reused_slot() {
        let mut arena = Arena::with_capacity("timers", 4);
        let old = arena.insert("first").unwrap();
        assert_eq!(arena.remove(old), Some("first"));
        let new = arena.insert("second").unwrap();
        assert_eq!(new.index, old.index);
        assert_ne!(new.generation, old.generation);
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena.get(new), Some(&"second"));
    }

    #[test]
    fn iter_skips_vacant_slots() {
        let mut arena = Arena::with_capacity("t", 8);
        let a = arena.insert('a').unwrap();
        arena.insert('b').unwrap();
        arena.remove(a);
        let values: Vec<char> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec!['b']);
        assert_eq!(arena.len(), 1);
    }
}
