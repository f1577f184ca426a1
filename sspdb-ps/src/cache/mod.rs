//! Process-local row cache.
//!
//! Rows are kept in two LRU lists. New rows enter the inactive list
//! and only move to the active list after being accessed often enough,
//! so a single scan over many rows cannot flush the rows that are
//! actually reused. Eviction always takes the least recently used
//! inactive row.
pub mod lru;

use self::lru::{LruList, NodeKey};
use crate::error::Result;
use crate::{Clock, ColumnID, RowID, RowValue, Update};
use std::collections::HashMap;

/// Default ratio of active list capacity to cache capacity.
pub const DEFAULT_ACTIVE_RATIO: f64 = 0.95;
/// Default number of accesses per column to promote a row.
pub const DEFAULT_ACCESSES_TO_PROMOTE: f64 = 1.0;

/// Snapshot of a row held by client process.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRow {
    /// Server clock the row was fresh at.
    pub clock: Clock,
    pub value: RowValue,
}

impl ClientRow {
    #[inline]
    pub fn new(clock: Clock, value: RowValue) -> Self {
        ClientRow { clock, value }
    }
}

/// Result of a cache lookup with freshness requirement.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// Row is cached but older than required clock.
    Stale,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    list: ListKind,
    key: NodeKey,
}

#[derive(Debug)]
struct Entry {
    row_id: RowID,
    row: ClientRow,
    accesses: f64,
}

/// Bounded row cache with LRU/2 eviction.
#[derive(Debug)]
pub struct RowCache {
    index: HashMap<RowID, Slot>,
    active: LruList<Entry>,
    inactive: LruList<Entry>,
    capacity: usize,
    active_capacity: usize,
    accesses_to_promote: f64,
}

impl RowCache {
    /// Create a new cache.
    /// Active capacity is clamped to be smaller than total capacity.
    #[inline]
    pub fn new(capacity: usize, active_capacity: usize, accesses_to_promote: f64) -> Self {
        debug_assert!(capacity > 0);
        let active_capacity = active_capacity.min(capacity.saturating_sub(1));
        RowCache {
            index: HashMap::with_capacity(capacity),
            active: LruList::new(),
            inactive: LruList::new(),
            capacity,
            active_capacity,
            accesses_to_promote,
        }
    }

    /// Create a cache with default active ratio and promotion threshold.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        let active_capacity = (capacity as f64 * DEFAULT_ACTIVE_RATIO) as usize;
        Self::new(capacity, active_capacity, DEFAULT_ACCESSES_TO_PROMOTE)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn active_capacity(&self) -> usize {
        self.active_capacity
    }

    #[inline]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    #[inline]
    pub fn inactive_len(&self) -> usize {
        self.inactive.len()
    }

    /// Check existence without counting an access.
    #[inline]
    pub fn has_row(&self, row_id: RowID) -> bool {
        self.index.contains_key(&row_id)
    }

    #[inline]
    pub fn is_active(&self, row_id: RowID) -> bool {
        matches!(self.index.get(&row_id), Some(s) if s.list == ListKind::Active)
    }

    /// Find row without counting an access.
    #[inline]
    pub fn find(&self, row_id: RowID) -> Option<&ClientRow> {
        let slot = self.index.get(&row_id)?;
        self.list(slot.list).get(slot.key).map(|e| &e.row)
    }

    /// Find mutable row without counting an access.
    #[inline]
    pub fn find_mut(&mut self, row_id: RowID) -> Option<&mut ClientRow> {
        let slot = *self.index.get(&row_id)?;
        self.list_mut(slot.list).get_mut(slot.key).map(|e| &mut e.row)
    }

    /// Read one column of a row cached at or after min_clock.
    #[inline]
    pub fn get(&mut self, row_id: RowID, col: ColumnID, min_clock: Clock) -> Result<Lookup<f32>> {
        let res = match self.find(row_id) {
            None => return Ok(Lookup::Miss),
            Some(row) if row.clock < min_clock => Lookup::Stale,
            Some(row) => Lookup::Hit(row.value.get(col)?),
        };
        self.touch(row_id, 1.0);
        Ok(res)
    }

    /// Copy out a whole row cached at or after min_clock.
    /// Weighs as many accesses as the row has columns.
    #[inline]
    pub fn get_row(&mut self, row_id: RowID, min_clock: Clock) -> Lookup<ClientRow> {
        let (res, weight) = match self.find(row_id) {
            None => return Lookup::Miss,
            Some(row) => {
                let weight = row.value.num_columns().max(1) as f64;
                if row.clock < min_clock {
                    (Lookup::Stale, weight)
                } else {
                    (Lookup::Hit(row.clone()), weight)
                }
            }
        };
        self.touch(row_id, weight);
        res
    }

    /// Apply update on a cached row.
    /// Returns false if the row is not cached.
    #[inline]
    pub fn apply(&mut self, row_id: RowID, col: ColumnID, update: &Update) -> Result<bool> {
        match self.find_mut(row_id) {
            None => return Ok(false),
            Some(row) => row.value.apply_update(col, update)?,
        }
        self.touch(row_id, 1.0);
        Ok(true)
    }

    /// Insert a new row or refresh an existing one.
    ///
    /// Insertion puts the row at the tail of inactive list and may evict
    /// the least recently used inactive row, which is returned.
    /// Refreshing keeps the row's position, and is ignored if the cached
    /// row is fresher than the incoming one.
    #[inline]
    pub fn put_row(&mut self, row_id: RowID, row: ClientRow) -> Option<RowID> {
        if let Some(cached) = self.find_mut(row_id) {
            if row.clock >= cached.clock {
                *cached = row;
            }
            return None;
        }
        let key = self.inactive.push_back(Entry {
            row_id,
            row,
            accesses: 0.0,
        });
        self.index.insert(
            row_id,
            Slot {
                list: ListKind::Inactive,
                key,
            },
        );
        if self.index.len() > self.capacity {
            return self.evict();
        }
        None
    }

    #[inline]
    pub fn erase(&mut self, row_id: RowID) -> Option<ClientRow> {
        let slot = self.index.remove(&row_id)?;
        self.list_mut(slot.list).remove(slot.key).map(|e| e.row)
    }

    #[inline]
    fn evict(&mut self) -> Option<RowID> {
        let entry = self.inactive.pop_front()?;
        self.index.remove(&entry.row_id);
        Some(entry.row_id)
    }

    /// Count an access of given weight, promote or relocate the row.
    #[inline]
    fn touch(&mut self, row_id: RowID, weight: f64) {
        let slot = match self.index.get(&row_id) {
            Some(slot) => *slot,
            None => return,
        };
        if slot.list == ListKind::Active {
            self.active.move_to_back(slot.key);
            return;
        }
        let promote = match self.inactive.get_mut(slot.key) {
            Some(entry) => {
                entry.accesses += weight;
                let threshold =
                    self.accesses_to_promote * entry.row.value.num_columns().max(1) as f64;
                entry.accesses >= threshold
            }
            None => return,
        };
        if !promote {
            self.inactive.move_to_back(slot.key);
            return;
        }
        if let Some(entry) = self.inactive.remove(slot.key) {
            let key = self.active.push_back(entry);
            self.index.insert(
                row_id,
                Slot {
                    list: ListKind::Active,
                    key,
                },
            );
        }
        if self.active.len() > self.active_capacity {
            if let Some(mut demoted) = self.active.pop_front() {
                demoted.accesses = 0.0;
                let demoted_id = demoted.row_id;
                let key = self.inactive.push_back(demoted);
                self.index.insert(
                    demoted_id,
                    Slot {
                        list: ListKind::Inactive,
                        key,
                    },
                );
            }
        }
    }

    #[inline]
    fn list(&self, kind: ListKind) -> &LruList<Entry> {
        match kind {
            ListKind::Active => &self.active,
            ListKind::Inactive => &self.inactive,
        }
    }

    #[inline]
    fn list_mut(&mut self, kind: ListKind) -> &mut LruList<Entry> {
        match kind {
            ListKind::Active => &mut self.active,
            ListKind::Inactive => &mut self.inactive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RowKind;

    fn row(clock: Clock, cols: usize) -> ClientRow {
        ClientRow::new(clock, RowValue::new(RowKind::Dense, cols))
    }

    #[test]
    fn test_row_cache_evict_without_access() {
        let mut cache = RowCache::with_capacity(4);
        for i in 0..4 {
            assert_eq!(cache.put_row(i, row(0, 2)), None);
        }
        assert_eq!(cache.put_row(4, row(0, 2)), Some(0));
        assert_eq!(cache.len(), 4);
        assert!(!cache.has_row(0));
        assert_eq!(cache.put_row(5, row(0, 2)), Some(1));
    }

    #[test]
    fn test_row_cache_promote_protects_row() {
        let mut cache = RowCache::new(3, 2, 1.0);
        cache.put_row(0, row(0, 1));
        cache.put_row(1, row(0, 1));
        cache.put_row(2, row(0, 1));
        assert!(matches!(cache.get_row(0, 0), Lookup::Hit(_)));
        assert!(matches!(cache.get_row(1, 0), Lookup::Hit(_)));
        assert!(cache.is_active(0));
        assert!(cache.is_active(1));
        assert_eq!(cache.put_row(3, row(0, 1)), Some(2));
        assert!(cache.has_row(0));
        assert!(cache.has_row(1));
        assert!(cache.has_row(3));
        assert!(!cache.has_row(2));
    }

    #[test]
    fn test_row_cache_entry_accesses_weighted_by_columns() {
        let mut cache = RowCache::new(10, 5, 1.0);
        cache.put_row(7, row(0, 3));
        for _ in 0..2 {
            assert_eq!(cache.get(7, 0, 0).unwrap(), Lookup::Hit(0.0));
            assert!(!cache.is_active(7));
        }
        assert_eq!(cache.get(7, 1, 0).unwrap(), Lookup::Hit(0.0));
        assert!(cache.is_active(7));
    }

    #[test]
    fn test_row_cache_fractional_promote_threshold() {
        let mut cache = RowCache::new(10, 5, 0.5);
        cache.put_row(1, row(0, 4));
        assert!(cache.apply(1, 0, &Update::Inc(1.0)).unwrap());
        assert!(!cache.is_active(1));
        assert!(cache.apply(1, 0, &Update::Inc(1.0)).unwrap());
        assert!(cache.is_active(1));
        assert_eq!(cache.find(1).unwrap().value.get(0).unwrap(), 2.0);
    }

    #[test]
    fn test_row_cache_demote_active() {
        let mut cache = RowCache::new(4, 1, 1.0);
        cache.put_row(0, row(0, 1));
        cache.put_row(1, row(0, 1));
        cache.get_row(0, 0);
        assert!(cache.is_active(0));
        cache.get_row(1, 0);
        // 0 is pushed back to inactive list with access count reset.
        assert!(cache.is_active(1));
        assert!(!cache.is_active(0));
        assert_eq!(cache.active_len(), 1);
        assert_eq!(cache.inactive_len(), 1);
        cache.put_row(2, row(0, 1));
        cache.put_row(3, row(0, 1));
        assert_eq!(cache.put_row(4, row(0, 1)), Some(0));
    }

    #[test]
    fn test_row_cache_has_row_is_not_access() {
        let mut cache = RowCache::new(2, 1, 1.0);
        cache.put_row(0, row(0, 1));
        cache.put_row(1, row(0, 1));
        for _ in 0..10 {
            assert!(cache.has_row(0));
            assert!(cache.find(0).is_some());
        }
        assert_eq!(cache.put_row(2, row(0, 1)), Some(0));
    }

    #[test]
    fn test_row_cache_staleness() {
        let mut cache = RowCache::with_capacity(10);
        cache.put_row(0, row(3, 2));
        assert_eq!(cache.get(0, 0, 4).unwrap(), Lookup::Stale);
        assert!(matches!(cache.get_row(0, 3), Lookup::Hit(r) if r.clock == 3));
        assert_eq!(cache.get(1, 0, 0).unwrap(), Lookup::Miss);
        assert!(cache.get(0, 2, 0).is_err());
    }

    #[test]
    fn test_row_cache_refresh() {
        let mut cache = RowCache::with_capacity(10);
        cache.put_row(0, row(3, 2));
        let mut newer = row(5, 2);
        newer.value.set(0, 1.0).unwrap();
        assert_eq!(cache.put_row(0, newer.clone()), None);
        assert_eq!(cache.find(0), Some(&newer));
        // older snapshot never replaces a fresher one.
        cache.put_row(0, row(4, 2));
        assert_eq!(cache.find(0), Some(&newer));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.erase(0), Some(newer));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_row_cache_active_capacity_clamped() {
        let cache = RowCache::new(5, 5, 1.0);
        assert_eq!(cache.active_capacity(), 4);
        let cache = RowCache::with_capacity(100);
        assert_eq!(cache.active_capacity(), 95);
    }
}
