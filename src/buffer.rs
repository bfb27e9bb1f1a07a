//! Bounded ring buffer shared between the acquisition worker and the refresh
//! step.
//!
//! The buffer is the single piece of state shared across threads in an
//! acquisition session: the worker appends on its own task, the periodic
//! refresh takes a consistent snapshot on the scheduler task. A plain mutex
//! around a `VecDeque` is deliberate: appends and snapshots are both short,
//! the write rate is one record per pulse, and the read cadence is seconds.
//!
//! Eviction is strict FIFO: once the buffer reaches capacity, each append
//! drops the oldest record, so after N appends to a buffer of capacity C the
//! contents are the last `min(N, C)` records in arrival order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A fixed-capacity buffer with oldest-first eviction.
#[derive(Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer. Capacity must be non-zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, evicting the oldest one if the buffer is full.
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the buffer holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Drop all items, keeping the capacity.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    /// An ordered (oldest to newest) copy of the current contents.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Shared handle to a ring buffer with one writer and snapshot readers.
///
/// The acquisition worker is the exclusive writer; the refresh step copies the
/// contents under the lock and computes on the copy, so aggregation never runs
/// while holding the lock and the worker is never blocked for longer than one
/// memcpy of the buffer.
#[derive(Debug)]
pub struct SharedRingBuffer<T> {
    inner: Arc<Mutex<RingBuffer<T>>>,
}

impl<T> Clone for SharedRingBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedRingBuffer<T> {
    /// Create a shared buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RingBuffer::new(capacity))),
        }
    }

    /// Append an item (worker side).
    pub fn push(&self, item: T) {
        self.lock().push(item);
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer holds no items.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Drop all items.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingBuffer<T>> {
        // A poisoned lock means a panic while pushing or snapshotting a
        // plain value; the data itself cannot be torn, so keep going.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Clone> SharedRingBuffer<T> {
    /// A consistent point-in-time copy of the contents (refresh side).
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_capacity_items_in_order() {
        // FIFO eviction property: last min(N, C) appends survive, in order.
        let mut buf = RingBuffer::new(5);
        for i in 0..10 {
            buf.push(i);
        }
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.snapshot(), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn underfilled_buffer_keeps_everything() {
        let mut buf = RingBuffer::new(100);
        for i in 0..7 {
            buf.push(i);
        }
        assert_eq!(buf.snapshot(), vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(buf.capacity(), 100);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = RingBuffer::new(3);
        buf.push(1);
        buf.push(2);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 3);
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn zero_capacity_is_rejected() {
        let _ = RingBuffer::<i32>::new(0);
    }

    #[test]
    fn shared_buffer_snapshot_is_a_copy() {
        let buf = SharedRingBuffer::new(4);
        buf.push(1);
        buf.push(2);
        let snap = buf.snapshot();
        buf.push(3);
        assert_eq!(snap, vec![1, 2]);
        assert_eq!(buf.snapshot(), vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_writer_and_reader_agree_on_final_state() {
        let buf = SharedRingBuffer::new(64);
        let writer = buf.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..1000 {
                writer.push(i);
            }
        });
        // Snapshots taken while the writer runs must always be internally
        // ordered, whatever their length.
        for _ in 0..50 {
            let snap = buf.snapshot();
            assert!(snap.windows(2).all(|w| w[0] < w[1]));
        }
        handle.join().expect("writer thread panicked");
        assert_eq!(buf.snapshot(), (1000 - 64..1000).collect::<Vec<_>>());
    }
}
