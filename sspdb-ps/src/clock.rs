use crate::error::{Error, Result};
use crate::Clock;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;

/// VectorClock tracks logical clocks of a set of participants
/// and the minimum among them.
///
/// Ticking a participant which is not the unique slowest one
/// is O(1). Only the unique slowest participant can move the
/// minimum forward.
#[derive(Debug, Clone)]
pub struct VectorClock<K> {
    clocks: HashMap<K, Clock>,
    min_clock: Clock,
}

impl<K: Copy + Eq + Hash> Default for VectorClock<K> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash> VectorClock<K> {
    #[inline]
    pub fn new() -> Self {
        VectorClock {
            clocks: HashMap::new(),
            min_clock: 0,
        }
    }

    /// Create a vector clock with all participants at clock 0.
    #[inline]
    pub fn with_ids<I: IntoIterator<Item = K>>(ids: I) -> Self {
        let mut vc = Self::new();
        for id in ids {
            vc.add_clock(id, 0);
        }
        vc
    }

    /// Register a new participant.
    /// Returns false if the participant already exists.
    #[inline]
    pub fn add_clock(&mut self, id: K, clock: Clock) -> bool {
        if self.clocks.contains_key(&id) {
            return false;
        }
        if self.clocks.is_empty() || clock < self.min_clock {
            self.min_clock = clock;
        }
        self.clocks.insert(id, clock);
        true
    }

    /// Increment clock of given participant.
    /// Returns true if the participant was the unique slowest one,
    /// in which case the minimum clock advances by one.
    #[inline]
    pub fn tick(&mut self, id: K) -> Result<bool> {
        let unique_min = self.is_unique_min(id);
        let clock = self.clocks.get_mut(&id).ok_or(Error::ClockNotRegistered)?;
        *clock += 1;
        if unique_min {
            self.min_clock += 1;
        }
        Ok(unique_min)
    }

    /// Raise clock of given participant to target clock.
    /// Returns the new minimum if it changed.
    #[inline]
    pub fn tick_until(&mut self, id: K, clock: Clock) -> Result<Option<Clock>> {
        let curr = self.clock(id).ok_or(Error::ClockNotRegistered)?;
        if clock <= curr {
            return Ok(None);
        }
        let unique_min = self.is_unique_min(id);
        self.clocks.insert(id, clock);
        if !unique_min {
            return Ok(None);
        }
        // the slowest one moved, find the new minimum.
        let new_min = self.clocks.values().copied().min().unwrap_or(clock);
        debug_assert!(new_min > self.min_clock);
        self.min_clock = new_min;
        Ok(Some(new_min))
    }

    #[inline]
    pub fn clock(&self, id: K) -> Option<Clock> {
        self.clocks.get(&id).copied()
    }

    #[inline]
    pub fn min_clock(&self) -> Clock {
        self.min_clock
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    #[inline]
    fn is_unique_min(&self, id: K) -> bool {
        if self.clocks.get(&id) != Some(&self.min_clock) {
            return false;
        }
        self.clocks.values().filter(|c| **c == self.min_clock).count() == 1
    }
}

/// Thread-safe vector clock shared by concurrent tickers.
#[derive(Debug)]
pub struct SyncVectorClock<K> {
    inner: Mutex<VectorClock<K>>,
}

impl<K: Copy + Eq + Hash> Default for SyncVectorClock<K> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash> SyncVectorClock<K> {
    #[inline]
    pub fn new() -> Self {
        SyncVectorClock {
            inner: Mutex::new(VectorClock::new()),
        }
    }

    #[inline]
    pub fn with_ids<I: IntoIterator<Item = K>>(ids: I) -> Self {
        SyncVectorClock {
            inner: Mutex::new(VectorClock::with_ids(ids)),
        }
    }

    #[inline]
    pub fn add_clock(&self, id: K, clock: Clock) -> bool {
        self.inner.lock().add_clock(id, clock)
    }

    /// Register a participant at current minimum clock, so the
    /// minimum never goes backwards. Returns the assigned clock,
    /// or None if already registered.
    #[inline]
    pub fn join(&self, id: K) -> Option<Clock> {
        let mut g = self.inner.lock();
        let clock = g.min_clock();
        if g.add_clock(id, clock) {
            Some(clock)
        } else {
            None
        }
    }

    #[inline]
    pub fn tick(&self, id: K) -> Result<bool> {
        self.inner.lock().tick(id)
    }

    #[inline]
    pub fn tick_until(&self, id: K, clock: Clock) -> Result<Option<Clock>> {
        self.inner.lock().tick_until(id, clock)
    }

    #[inline]
    pub fn clock(&self, id: K) -> Option<Clock> {
        self.inner.lock().clock(id)
    }

    #[inline]
    pub fn min_clock(&self) -> Clock {
        self.inner.lock().min_clock()
    }
}

/// Clock of the whole process which threads can wait on.
#[derive(Debug, Default)]
pub struct ProcessClock {
    clock: Mutex<Clock>,
    cv: Condvar,
}

impl ProcessClock {
    #[inline]
    pub fn get(&self) -> Clock {
        *self.clock.lock()
    }

    /// Move clock forward and wake up all waiters.
    /// Smaller clock is ignored.
    #[inline]
    pub fn advance_to(&self, clock: Clock) {
        let mut g = self.clock.lock();
        if clock > *g {
            *g = clock;
            self.cv.notify_all();
        }
    }

    /// Block until clock reaches given value.
    #[inline]
    pub fn wait_until(&self, clock: Clock) {
        let mut g = self.clock.lock();
        while *g < clock {
            self.cv.wait(&mut g);
        }
    }
}
