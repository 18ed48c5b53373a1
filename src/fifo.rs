/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Reservation/commit ring buffer disciplines.
//!
//! A FIFO here only manages cursors; the element storage is owned by the
//! caller and addressed through [`Position`]. Reserving returns a lock that
//! describes the region to read or write. Committing the lock advances the
//! corresponding cursor; dropping it without commit leaves the FIFO
//! unchanged. Producer and consumer cursors are monotonically increasing
//! counters, so `write - read` is the current fill level at all times.
//!
//! Five disciplines share the same external contract:
//!
//! | variant  | writers | readers | realtime-safe produce | realtime-safe consume |
//! |----------|---------|---------|-----------------------|-----------------------|
//! | `Single` | 1       | 1 (same thread) | yes           | yes                   |
//! | `Spsc`   | 1       | 1       | yes                   | yes                   |
//! | `Mpsc`   | n       | 1       | no (mutex)            | yes                   |
//! | `Spmc`   | 1       | n       | yes                   | no (mutex)            |
//! | `Mpmc`   | n       | n       | no                    | no                    |

use std::{
    cell::Cell,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

/// The region of the underlying storage covered by a reservation. The region
/// is `[index1, index1 + size1)` followed by `[0, size2)` when the request
/// wraps around the end of the buffer; `size1 + size2` always equals the
/// reserved element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub index1: usize,
    pub size1: usize,
    pub size2: usize,
}

impl Position {
    pub fn new(timestamp: usize, capacity: usize, number_of_elements: usize) -> Self {
        debug_assert!(
            number_of_elements <= capacity,
            "number of elements must be less than or equal to capacity"
        );
        let index1 = timestamp % capacity;
        let mut size1 = number_of_elements;
        let mut size2 = 0;

        if index1 + number_of_elements > capacity {
            size1 = capacity - index1;
            size2 = number_of_elements - size1;
        }

        Position {
            index1,
            size1,
            size2,
        }
    }

    /// Splits `storage` into the two slices covered by this position.
    pub fn slices<'a, T>(&self, storage: &'a [T]) -> (&'a [T], &'a [T]) {
        (
            &storage[self.index1..self.index1 + self.size1],
            &storage[..self.size2],
        )
    }

    /// Splits `storage` into the two mutable slices covered by this position.
    pub fn slices_mut<'a, T>(&self, storage: &'a mut [T]) -> (&'a mut [T], &'a mut [T]) {
        let (head, tail) = storage.split_at_mut(self.index1);
        (&mut tail[..self.size1], &mut head[..self.size2])
    }
}

/// A fifo without any synchronization, for use within a single thread.
#[derive(Debug, Default)]
pub struct SingleFifo {
    read_ts: Cell<usize>,
    write_ts: Cell<usize>,
    capacity: Cell<usize>,
}

/// A reservation on a [`SingleFifo`]. Must be committed to take effect.
#[must_use]
pub struct SingleLock<'a> {
    pub position: Position,
    cursor: &'a Cell<usize>,
    count: usize,
}

impl SingleLock<'_> {
    pub fn commit(self) {
        self.cursor.set(self.cursor.get() + self.count);
    }
}

impl SingleFifo {
    pub fn new(capacity: usize) -> Self {
        let fifo = SingleFifo::default();
        fifo.capacity.set(capacity);
        fifo
    }

    pub fn reserve_write(&self, number_of_elements: usize) -> Option<SingleLock<'_>> {
        if self.write_ts.get() - self.read_ts.get() + number_of_elements > self.capacity.get() {
            return None;
        }
        Some(SingleLock {
            position: Position::new(self.write_ts.get(), self.capacity.get(), number_of_elements),
            cursor: &self.write_ts,
            count: number_of_elements,
        })
    }

    pub fn reserve_read(&self, number_of_elements: usize) -> Option<SingleLock<'_>> {
        if self.write_ts.get() - self.read_ts.get() < number_of_elements {
            return None;
        }
        Some(SingleLock {
            position: Position::new(self.read_ts.get(), self.capacity.get(), number_of_elements),
            cursor: &self.read_ts,
            count: number_of_elements,
        })
    }

    pub fn size(&self) -> usize {
        self.write_ts.get() - self.read_ts.get()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn reset(&self) {
        self.read_ts.set(0);
        self.write_ts.set(0);
    }

    /// Resizes the buffer. Implies a reset.
    pub fn resize(&self, capacity: usize) {
        self.reset();
        self.capacity.set(capacity);
    }
}

/// A fifo which a single producer and a single consumer thread can
/// simultaneously write to and read from without locking.
#[derive(Debug, Default)]
pub struct SpscFifo {
    read_ts: AtomicUsize,
    write_ts: AtomicUsize,
    capacity: usize,
}

/// A reservation on a lock-free fifo. Committing publishes the reserved
/// region with release ordering, so element writes made before the commit are
/// visible to the other side before the cursor advances.
#[must_use]
pub struct AtomicLock<'a> {
    pub position: Position,
    cursor: &'a AtomicUsize,
    count: usize,
}

impl AtomicLock<'_> {
    pub fn commit(self) {
        self.cursor.fetch_add(self.count, Ordering::Release);
    }
}

impl SpscFifo {
    pub fn new(capacity: usize) -> Self {
        SpscFifo {
            capacity,
            ..SpscFifo::default()
        }
    }

    pub fn reserve_write(&self, number_of_elements: usize) -> Option<AtomicLock<'_>> {
        let write = self.write_ts.load(Ordering::Relaxed);
        let read = self.read_ts.load(Ordering::Acquire);
        if write - read + number_of_elements > self.capacity {
            return None;
        }
        Some(AtomicLock {
            position: Position::new(write, self.capacity, number_of_elements),
            cursor: &self.write_ts,
            count: number_of_elements,
        })
    }

    pub fn reserve_read(&self, number_of_elements: usize) -> Option<AtomicLock<'_>> {
        let write = self.write_ts.load(Ordering::Acquire);
        let read = self.read_ts.load(Ordering::Relaxed);
        if write - read < number_of_elements {
            return None;
        }
        Some(AtomicLock {
            position: Position::new(read, self.capacity, number_of_elements),
            cursor: &self.read_ts,
            count: number_of_elements,
        })
    }

    pub fn size(&self) -> usize {
        self.write_ts.load(Ordering::Acquire) - self.read_ts.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.read_ts.store(0, Ordering::Relaxed);
        self.write_ts.store(0, Ordering::Relaxed);
    }

    /// Resizes the buffer. Implies a reset.
    pub fn resize(&mut self, capacity: usize) {
        self.reset();
        self.capacity = capacity;
    }
}

/// A fifo where multiple producer threads write, serialized by a mutex, and a
/// single consumer thread reads lock-free.
#[derive(Debug, Default)]
pub struct MpscFifo {
    read_ts: AtomicUsize,
    write_ts: AtomicUsize,
    capacity: usize,
    write_mutex: Mutex<()>,
}

/// A reservation that additionally holds the side mutex until it is committed
/// or dropped.
#[must_use]
pub struct GuardedLock<'a> {
    pub position: Position,
    cursor: &'a AtomicUsize,
    count: usize,
    _guard: MutexGuard<'a, ()>,
}

impl GuardedLock<'_> {
    pub fn commit(self) {
        self.cursor.fetch_add(self.count, Ordering::Release);
    }
}

impl MpscFifo {
    pub fn new(capacity: usize) -> Self {
        MpscFifo {
            capacity,
            ..MpscFifo::default()
        }
    }

    pub fn reserve_write(&self, number_of_elements: usize) -> Option<GuardedLock<'_>> {
        let guard = match self.write_mutex.lock() {
            Ok(it) => it,
            Err(poisoned) => poisoned.into_inner(),
        };
        let write = self.write_ts.load(Ordering::Relaxed);
        let read = self.read_ts.load(Ordering::Acquire);
        if write - read + number_of_elements > self.capacity {
            return None;
        }
        Some(GuardedLock {
            position: Position::new(write, self.capacity, number_of_elements),
            cursor: &self.write_ts,
            count: number_of_elements,
            _guard: guard,
        })
    }

    pub fn reserve_read(&self, number_of_elements: usize) -> Option<AtomicLock<'_>> {
        let write = self.write_ts.load(Ordering::Acquire);
        let read = self.read_ts.load(Ordering::Relaxed);
        if write - read < number_of_elements {
            return None;
        }
        Some(AtomicLock {
            position: Position::new(read, self.capacity, number_of_elements),
            cursor: &self.read_ts,
            count: number_of_elements,
        })
    }

    pub fn size(&self) -> usize {
        self.write_ts.load(Ordering::Acquire) - self.read_ts.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.read_ts.store(0, Ordering::Relaxed);
        self.write_ts.store(0, Ordering::Relaxed);
    }

    /// Resizes the buffer. Implies a reset.
    pub fn resize(&mut self, capacity: usize) {
        self.reset();
        self.capacity = capacity;
    }
}

/// A fifo where a single producer thread writes lock-free and multiple
/// consumer threads read, serialized by a mutex.
#[derive(Debug, Default)]
pub struct SpmcFifo {
    read_ts: AtomicUsize,
    write_ts: AtomicUsize,
    capacity: usize,
    read_mutex: Mutex<()>,
}

impl SpmcFifo {
    pub fn new(capacity: usize) -> Self {
        SpmcFifo {
            capacity,
            ..SpmcFifo::default()
        }
    }

    pub fn reserve_write(&self, number_of_elements: usize) -> Option<AtomicLock<'_>> {
        let write = self.write_ts.load(Ordering::Relaxed);
        let read = self.read_ts.load(Ordering::Acquire);
        if write - read + number_of_elements > self.capacity {
            return None;
        }
        Some(AtomicLock {
            position: Position::new(write, self.capacity, number_of_elements),
            cursor: &self.write_ts,
            count: number_of_elements,
        })
    }

    pub fn reserve_read(&self, number_of_elements: usize) -> Option<GuardedLock<'_>> {
        let guard = match self.read_mutex.lock() {
            Ok(it) => it,
            Err(poisoned) => poisoned.into_inner(),
        };
        let write = self.write_ts.load(Ordering::Acquire);
        let read = self.read_ts.load(Ordering::Relaxed);
        if write - read < number_of_elements {
            return None;
        }
        Some(GuardedLock {
            position: Position::new(read, self.capacity, number_of_elements),
            cursor: &self.read_ts,
            count: number_of_elements,
            _guard: guard,
        })
    }

    pub fn size(&self) -> usize {
        self.write_ts.load(Ordering::Acquire) - self.read_ts.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.read_ts.store(0, Ordering::Relaxed);
        self.write_ts.store(0, Ordering::Relaxed);
    }

    /// Resizes the buffer. Implies a reset.
    pub fn resize(&mut self, capacity: usize) {
        self.reset();
        self.capacity = capacity;
    }
}

/// A fifo where multiple producer and multiple consumer threads share one
/// mutex for all cursor operations.
#[derive(Debug, Default)]
pub struct MpmcFifo {
    cursors: Mutex<MpmcCursors>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct MpmcCursors {
    read_ts: usize,
    write_ts: usize,
}

/// A reservation on an [`MpmcFifo`], holding the fifo mutex.
#[must_use]
pub struct MpmcLock<'a> {
    pub position: Position,
    guard: MutexGuard<'a, MpmcCursors>,
    count: usize,
    write: bool,
}

impl MpmcLock<'_> {
    pub fn commit(mut self) {
        if self.write {
            self.guard.write_ts += self.count;
        } else {
            self.guard.read_ts += self.count;
        }
    }
}

impl MpmcFifo {
    pub fn new(capacity: usize) -> Self {
        MpmcFifo {
            capacity,
            ..MpmcFifo::default()
        }
    }

    fn lock_cursors(&self) -> MutexGuard<'_, MpmcCursors> {
        match self.cursors.lock() {
            Ok(it) => it,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn reserve_write(&self, number_of_elements: usize) -> Option<MpmcLock<'_>> {
        let guard = self.lock_cursors();
        if guard.write_ts - guard.read_ts + number_of_elements > self.capacity {
            return None;
        }
        Some(MpmcLock {
            position: Position::new(guard.write_ts, self.capacity, number_of_elements),
            guard,
            count: number_of_elements,
            write: true,
        })
    }

    pub fn reserve_read(&self, number_of_elements: usize) -> Option<MpmcLock<'_>> {
        let guard = self.lock_cursors();
        if guard.write_ts - guard.read_ts < number_of_elements {
            return None;
        }
        Some(MpmcLock {
            position: Position::new(guard.read_ts, self.capacity, number_of_elements),
            guard,
            count: number_of_elements,
            write: false,
        })
    }

    pub fn size(&self) -> usize {
        let guard = self.lock_cursors();
        guard.write_ts - guard.read_ts
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        let mut guard = self.lock_cursors();
        guard.read_ts = 0;
        guard.write_ts = 0;
    }

    /// Resizes the buffer. Implies a reset.
    pub fn resize(&mut self, capacity: usize) {
        self.reset();
        self.capacity = capacity;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_pattern(storage: &mut [u8], position: Position, pattern: &[u8]) {
        let (a, b) = position.slices_mut(storage);
        a.copy_from_slice(&pattern[..a.len()]);
        b.copy_from_slice(&pattern[a.len()..]);
    }

    fn read_pattern(storage: &[u8], position: Position) -> Vec<u8> {
        let (a, b) = position.slices(storage);
        let mut out = a.to_vec();
        out.extend_from_slice(b);
        out
    }

    #[test]
    fn position_splits_on_wrap() {
        let pos = Position::new(6, 8, 4);
        assert_eq!(
            pos,
            Position {
                index1: 6,
                size1: 2,
                size2: 2
            }
        );

        let pos = Position::new(4, 8, 4);
        assert_eq!(
            pos,
            Position {
                index1: 4,
                size1: 4,
                size2: 0
            }
        );
    }

    #[test]
    fn reserving_full_capacity_succeeds_one_more_fails() {
        let fifo = SpscFifo::new(8);
        assert!(fifo.reserve_write(9).is_none());
        let lock = fifo.reserve_write(8).expect("full capacity must fit");
        lock.commit();
        assert_eq!(fifo.size(), 8);
        assert!(fifo.reserve_write(1).is_none());
    }

    #[test]
    fn dropped_lock_leaves_fifo_unchanged() {
        let fifo = SpscFifo::new(8);
        {
            let _lock = fifo.reserve_write(4);
        }
        assert_eq!(fifo.size(), 0);
        assert!(fifo.reserve_read(1).is_none());
    }

    #[test]
    fn read_requires_committed_data() {
        let fifo = SingleFifo::new(8);
        assert!(fifo.reserve_read(1).is_none());
        fifo.reserve_write(3).expect("space available").commit();
        assert!(fifo.reserve_read(4).is_none());
        fifo.reserve_read(3).expect("data available").commit();
        assert_eq!(fifo.size(), 0);
    }

    #[test]
    fn spsc_wrap_preserves_element_order() {
        let fifo = SpscFifo::new(8);
        let mut storage = [0u8; 8];

        let lock = fifo.reserve_write(6).expect("empty fifo fits 6");
        write_pattern(&mut storage, lock.position, &[1, 2, 3, 4, 5, 6]);
        lock.commit();

        let lock = fifo.reserve_read(4).expect("6 committed");
        assert_eq!(read_pattern(&storage, lock.position), [1, 2, 3, 4]);
        lock.commit();

        let lock = fifo.reserve_write(6).expect("4 free + 2 used fits 6");
        write_pattern(&mut storage, lock.position, &[7, 8, 9, 10, 11, 12]);
        lock.commit();

        let lock = fifo.reserve_read(8).expect("8 committed");
        assert_eq!(
            read_pattern(&storage, lock.position),
            [5, 6, 7, 8, 9, 10, 11, 12]
        );
        lock.commit();
    }

    #[test]
    fn mpsc_write_is_serialized_but_read_is_lock_free() {
        let fifo = MpscFifo::new(4);
        fifo.reserve_write(2).expect("space").commit();
        fifo.reserve_write(2).expect("space").commit();
        assert!(fifo.reserve_write(1).is_none());
        fifo.reserve_read(4).expect("data").commit();
        assert_eq!(fifo.size(), 0);
    }

    #[test]
    fn mpmc_cursors_stay_consistent() {
        let mut fifo = MpmcFifo::new(4);
        fifo.reserve_write(3).expect("space").commit();
        assert_eq!(fifo.size(), 3);
        fifo.reserve_read(2).expect("data").commit();
        assert_eq!(fifo.size(), 1);
        fifo.resize(2);
        assert_eq!(fifo.size(), 0);
        assert_eq!(fifo.capacity(), 2);
    }

    #[test]
    fn spmc_read_reservation_excludes_other_readers() {
        let fifo = SpmcFifo::new(8);
        fifo.reserve_write(4).expect("space").commit();
        let lock = fifo.reserve_read(2).expect("data");
        lock.commit();
        assert_eq!(fifo.size(), 2);
    }
}
