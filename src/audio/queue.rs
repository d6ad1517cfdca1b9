//! Bounded FIFO used to hand buffers between stages
//!
//! Each queue is a fixed-capacity ring guarded by a spin lock. Critical
//! sections are a handful of instructions and never allocate, so the lock is
//! safe to take from an audio callback; a parking mutex could put the callback
//! to sleep behind a preempted control thread.

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

/// Bounded, thread-safe FIFO of owned items (sample buffers in practice)
///
/// `push` on a full queue hands the item back instead of blocking or
/// dropping it; `pop` on an empty queue returns `None`.
pub struct BufferQueue<T> {
    ring: spin::Mutex<HeapRb<T>>,
    capacity: usize,
}

impl<T> BufferQueue<T> {
    /// Create an empty queue holding at most `capacity` items
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self {
            ring: spin::Mutex::new(HeapRb::new(capacity)),
            capacity,
        }
    }

    /// Append `item`, or return it if the queue is full
    pub fn push(&self, item: T) -> Result<(), T> {
        self.ring.lock().try_push(item)
    }

    /// Remove the oldest item
    pub fn pop(&self) -> Option<T> {
        self.ring.lock().try_pop()
    }

    /// Inspect the oldest item without removing it
    pub fn front<R>(&self, peek: impl FnOnce(&T) -> R) -> Option<R> {
        self.ring.lock().try_peek().map(peek)
    }

    /// Inspect and remove the oldest item under a single lock
    pub fn front_and_pop<R>(&self, peek: impl FnOnce(&T) -> R) -> Option<(R, T)> {
        let mut ring = self.ring.lock();
        let seen = ring.try_peek().map(peek)?;
        ring.try_pop().map(|item| (seen, item))
    }

    /// Instantaneous item count
    ///
    /// Racy under concurrent push/pop; use for diagnostics only.
    pub fn len(&self) -> usize {
        self.ring.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.lock().is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pop every item into `sink`, oldest first; returns the number moved
    pub fn drain(&self, mut sink: impl FnMut(T)) -> usize {
        let mut moved = 0;
        while let Some(item) = self.pop() {
            sink(item);
            moved += 1;
        }
        moved
    }
}
