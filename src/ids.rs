//! Compact id allocation over a fixed id range.
//!
//! `IdArena` keeps values in an ordered map, so a range with a few ids far
//! apart costs no more than a dense one. The lowest free id is always handed
//! out first, which keeps signal ids dense at the start of the page.
//!
//! Free ids are tracked in two parts: vacated ids below the allocation
//! cursor `next` sit in a free set, and every id at or above `next` that has
//! no entry is free.

use alloc::collections::btree_map::IntoValues;
use alloc::collections::{BTreeMap, BTreeSet};

use axerrno::{ax_err, AxError, AxResult};

/// Arena of values keyed by ids in `[base, last]`.
pub struct IdArena<T> {
    base: u32,
    last: u32,
    entries: BTreeMap<u32, T>,
    /// Vacant ids below `next`.
    free: BTreeSet<u32>,
    next: u64,
}

impl<T> IdArena<T> {
    /// Creates an empty arena for ids in `[base, last]`.
    pub fn new(base: u32, last: u32) -> Self {
        Self {
            base,
            last,
            entries: BTreeMap::new(),
            free: BTreeSet::new(),
            next: base as u64,
        }
    }

    /// Returns `true` if `id` belongs to this arena's range.
    #[inline]
    pub fn in_range(&self, id: u32) -> bool {
        id >= self.base && id <= self.last
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    /// Allocates the lowest free id below `limit` and stores `make(id)` there.
    ///
    /// # Errors
    ///
    /// Returns `StorageFull` (without logging) when no id below `limit` is
    /// free.
    pub fn alloc_with(&mut self, limit: u32, make: impl FnOnce(u32) -> T) -> AxResult<u32> {
        let end = (limit as u64).min(self.last as u64 + 1);

        let id = match self.free.first().copied().filter(|&id| (id as u64) < end) {
            Some(id) => {
                self.free.remove(&id);
                id
            }
            None => {
                // Skip ids taken by exact-id inserts above the cursor.
                let mut candidate = self.next;
                while candidate < end && self.entries.contains_key(&(candidate as u32)) {
                    candidate += 1;
                }
                if candidate >= end {
                    return Err(AxError::StorageFull);
                }
                self.next = candidate + 1;
                candidate as u32
            }
        };

        self.entries.insert(id, make(id));
        Ok(id)
    }

    /// Stores `value` under exactly `id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `id` is outside the range or already taken.
    pub fn insert_at(&mut self, id: u32, value: T) -> AxResult {
        if !self.in_range(id) {
            return ax_err!(InvalidInput, "Id outside of arena range");
        }
        if self.entries.contains_key(&id) {
            return ax_err!(InvalidInput, "Id already in use");
        }

        if (id as u64) < self.next {
            self.free.remove(&id);
        }
        self.entries.insert(id, value);
        Ok(())
    }

    /// Removes and returns the value stored under `id`.
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let value = self.entries.remove(&id)?;
        if (id as u64) < self.next {
            self.free.insert(id);
        }
        Some(value)
    }

    /// Number of live values.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// First live value with an id `>= start`.
    pub fn next_from(&self, start: u32) -> Option<(u32, &T)> {
        self.entries.range(start..).next().map(|(&id, value)| (id, value))
    }

    /// Live values in ascending id order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    /// Live values in ascending id order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    /// Removes every value.
    pub fn drain(&mut self) -> IntoValues<u32, T> {
        self.free.clear();
        self.next = self.base as u64;
        core::mem::take(&mut self.entries).into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_arena_lowest_id_first() {
        let mut arena = IdArena::new(0, 15);
        assert_eq!(arena.alloc_with(16, |id| id), Ok(0));
        assert_eq!(arena.alloc_with(16, |id| id), Ok(1));
        assert_eq!(arena.alloc_with(16, |id| id), Ok(2));

        // Reuse the lowest vacated id
        assert_eq!(arena.remove(1), Some(1));
        assert_eq!(arena.alloc_with(16, |id| id), Ok(1));
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_arena_limit() {
        let mut arena = IdArena::new(0, 15);
        assert_eq!(arena.alloc_with(2, |id| id), Ok(0));
        assert_eq!(arena.alloc_with(2, |id| id), Ok(1));
        assert_eq!(arena.alloc_with(2, |id| id), Err(AxError::StorageFull));

        // A larger limit opens up more ids
        assert_eq!(arena.alloc_with(4, |id| id), Ok(2));
    }

    #[test]
    fn test_arena_base_offset() {
        let mut arena = IdArena::new(100, 200);
        assert_eq!(arena.alloc_with(u32::MAX, |id| id), Ok(100));
        assert_eq!(arena.get(100), Some(&100));
        assert_eq!(arena.get(5), None);
        assert_eq!(arena.alloc_with(50, |id| id), Err(AxError::StorageFull));
    }

    #[test]
    fn test_arena_insert_at() {
        let mut arena = IdArena::new(0, 63);
        arena.insert_at(5, 'a').unwrap();
        assert!(arena.insert_at(5, 'b').is_err());
        assert!(arena.insert_at(64, 'c').is_err());

        // Gap below the restored id is still allocatable, lowest first
        assert_eq!(arena.alloc_with(64, |_| 'd'), Ok(0));
        assert_eq!(arena.next_from(1), Some((5, &'a')));
        assert_eq!(arena.next_from(6), None);
    }

    #[test]
    fn test_arena_sparse_insert() {
        let mut arena = IdArena::new(4096, 0x7fff_ffff);
        let far = 4096 + 30_000_000;
        arena.insert_at(far, 'x').unwrap();

        // Nothing below the far id is materialised
        assert_eq!(arena.len(), 1);
        assert!(arena.free.is_empty());
        assert_eq!(arena.values().count(), 1);
        assert_eq!(arena.next_from(0), Some((far, &'x')));

        assert_eq!(arena.alloc_with(u32::MAX, |_| 'y'), Ok(4096));
        assert_eq!(arena.remove(far), Some('x'));
        assert!(arena.free.is_empty());
        assert_eq!(arena.alloc_with(u32::MAX, |_| 'z'), Ok(4097));
    }

    #[test]
    fn test_arena_skips_inserted_ids() {
        let mut arena = IdArena::new(0, 15);
        arena.insert_at(0, 'a').unwrap();
        arena.insert_at(1, 'b').unwrap();
        arena.insert_at(3, 'c').unwrap();

        assert_eq!(arena.alloc_with(16, |_| 'd'), Ok(2));
        assert_eq!(arena.alloc_with(16, |_| 'e'), Ok(4));

        // Ids vacated below the cursor come back first
        arena.remove(1);
        assert_eq!(arena.alloc_with(16, |_| 'f'), Ok(1));
        assert_eq!(arena.alloc_with(4, |_| 'g'), Err(AxError::StorageFull));
    }

    #[test]
    fn test_arena_drain() {
        let mut arena = IdArena::new(0, 7);
        for _ in 0..4 {
            arena.alloc_with(8, |id| id).unwrap();
        }
        arena.remove(2);
        let drained: Vec<u32> = arena.drain().collect();
        assert_eq!(drained, alloc::vec![0, 1, 3]);
        assert_eq!(arena.len(), 0);
        assert_eq!(arena.alloc_with(8, |id| id), Ok(0));
    }
}
