use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A capacity-bounded FIFO shared between pipeline stages.
///
/// Offers never block: a full queue hands the item back to the caller, which
/// decides whether to back off or give up. Consumers may poll, peek, or wait
/// on the queue with a timeout.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    capacity: usize,
    rejected_count: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create a new queue holding at most `capacity` items
    ///
    /// # Panics
    ///
    /// Panics if capacity is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            not_empty: Condvar::new(),
            capacity,
            rejected_count: AtomicU64::new(0),
        }
    }

    /// Append an item, returning it if the queue is full
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            self.rejected_count.fetch_add(1, Ordering::Relaxed);
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append every item or none of them
    pub fn offer_all(&self, batch: Vec<T>) -> Result<(), Vec<T>> {
        let mut items = self.items.lock();
        if self.capacity - items.len() < batch.len() {
            self.rejected_count.fetch_add(1, Ordering::Relaxed);
            return Err(batch);
        }
        items.extend(batch);
        drop(items);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Remove the head item
    pub fn poll(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Remove the head item, waiting up to `timeout` for one to arrive
    pub fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock();
        if items.is_empty() {
            let _ = self
                .not_empty
                .wait_while_for(&mut items, |items| items.is_empty(), timeout);
        }
        items.pop_front()
    }

    /// Remove up to `max` items from the head
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock();
        let take = max.min(items.len());
        items.drain(..take).collect()
    }

    /// Move up to `max` items into `target`, bounded by its free space.
    ///
    /// Returns the number of items moved.
    pub fn drain_into(&self, target: &BoundedQueue<T>, max: usize) -> usize {
        let mut dest = target.items.lock();
        let room = target.capacity - dest.len();
        let mut src = self.items.lock();
        let take = max.min(room).min(src.len());
        dest.extend(src.drain(..take));
        drop(src);
        drop(dest);
        if take > 0 {
            target.not_empty.notify_all();
        }
        take
    }

    /// Remove every item, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let count = items.len();
        items.clear();
        count
    }

    /// Get the current number of items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Check if the queue cannot take another item
    pub fn is_full(&self) -> bool {
        !self.has_room_for(1)
    }

    /// Check if `count` more items would fit
    pub fn has_room_for(&self, count: usize) -> bool {
        self.remaining_capacity() >= count
    }

    /// Get the capacity of the queue
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    /// Get the utilization of the queue as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        let percent = self.len().saturating_mul(100) / self.capacity;
        percent.min(100) as u32
    }

    /// Number of offers turned away because the queue was full
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Clone the head item without removing it
    pub fn peek(&self) -> Option<T> {
        self.items.lock().front().cloned()
    }

    /// Clone every queued item in FIFO order
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().iter().cloned().collect()
    }
}
