//! Process-wide table mapping a random 32-bit session index to whatever a
//! caller wants to associate with it (a handshake in progress, or an
//! established keypair).

use std::collections::hash_map::Entry;

use ahash::AHashMap;
use rand_core::RngCore;

pub struct IndexTable<V> {
    map: AHashMap<u32, V>,
}

impl<V> Default for IndexTable<V> {
    fn default() -> Self {
        Self {
            map: AHashMap::default(),
        }
    }
}

impl<V> IndexTable<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks a fresh random index, retrying on collision, and binds
    /// `value` to it.
    pub fn insert(&mut self, rng: &mut impl RngCore, value: V) -> u32 {
        loop {
            let idx = rng.next_u32();
            if let Entry::Vacant(e) = self.map.entry(idx) {
                e.insert(value);
                return idx;
            }
        }
    }

    pub fn get(&self, index: u32) -> Option<&V> {
        self.map.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut V> {
        self.map.get_mut(&index)
    }

    pub fn remove(&mut self, index: u32) -> Option<V> {
        self.map.remove(&index)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn insert_then_get_round_trips() {
        let mut table = IndexTable::new();
        let mut rng = OsRng;
        let idx = table.insert(&mut rng, "handshake-in-progress");
        assert_eq!(table.get(idx), Some(&"handshake-in-progress"));
    }

    #[test]
    fn remove_drops_the_entry() {
        let mut table = IndexTable::new();
        let mut rng = OsRng;
        let idx = table.insert(&mut rng, 7u32);
        assert_eq!(table.remove(idx), Some(7));
        assert_eq!(table.get(idx), None);
    }

    #[test]
    fn distinct_inserts_get_distinct_indices_with_overwhelming_probability() {
        let mut table = IndexTable::new();
        let mut rng = OsRng;
        let a = table.insert(&mut rng, 1u32);
        let b = table.insert(&mut rng, 2u32);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }
}
