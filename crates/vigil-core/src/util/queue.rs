//! Multiple-producer / single-consumer queue with shutdown-aware
//! blocking pop.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded-or-unbounded FIFO. `wait_and_pop` blocks until an item is
/// available and returns `None` only when the queue is closed and
/// drained, so the consumer thread can use it as its loop condition.
pub struct AlertQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: Option<usize>,
}

impl<T> AlertQueue<T> {
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Push an item. Returns `false` when the queue is closed or a
    /// bounded queue is full; the item is dropped in both cases.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        if let Some(cap) = self.capacity
            && inner.items.len() >= cap
        {
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.available.notify_one();
        true
    }

    /// Block until an item arrives. Returns `None` only once the queue
    /// has been shut down and every queued item has been consumed.
    pub fn wait_and_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue and wake all waiters. Queued items remain
    /// poppable; new pushes are refused.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().closed = true;
        self.available.notify_all();
    }
}
