//! Bounded sliding window over timestamped events.
//!
//! Timestamps are stored as 32-bit millisecond deltas from a per-window
//! base. When a delta would overflow, the window rebases onto the new
//! timestamp and drops elements that fall before the new base.

use std::collections::VecDeque;

/// A bounded ordered sequence of `(timestamp_ms, T)` pairs.
///
/// Two pruning rules apply on every insert and on demand:
/// - age: elements older than `duration_ms` relative to the prune time
///   are removed from the front;
/// - count: the window never holds more than `max_elements` entries.
///
/// Inserting a timestamp older than the newest stored one resets the
/// window (the source is expected to deliver events in order; a step
/// backwards means the clock or the source restarted).
#[derive(Clone, Debug)]
pub struct SlidingWindow<T> {
    duration_ms: u64,
    max_elements: usize,
    base_ms: u64,
    entries: VecDeque<(u32, T)>,
}

/// Window that tracks timestamps only.
pub type TimestampWindow = SlidingWindow<()>;

impl<T> SlidingWindow<T> {
    pub fn new(duration_ms: u64, max_elements: usize) -> Self {
        Self {
            duration_ms,
            max_elements: max_elements.max(1),
            base_ms: 0,
            entries: VecDeque::new(),
        }
    }

    /// Insert an event and apply both pruning rules.
    pub fn insert(&mut self, timestamp_ms: u64, value: T) {
        if self.entries.is_empty() {
            self.base_ms = timestamp_ms;
        } else if timestamp_ms < self.newest_ms().unwrap_or(0) {
            // Out-of-order input: reset rather than store a lie.
            self.entries.clear();
            self.base_ms = timestamp_ms;
        }

        let delta = timestamp_ms - self.base_ms;
        let delta = if delta > u32::MAX as u64 {
            self.rebase(timestamp_ms);
            0
        } else {
            delta as u32
        };

        self.entries.push_back((delta, value));
        self.prune(timestamp_ms);
    }

    /// Remove elements older than `now - duration` and enforce the
    /// element cap.
    pub fn prune(&mut self, now_ms: u64) {
        if self.duration_ms > 0 {
            let cutoff = now_ms.saturating_sub(self.duration_ms);
            while let Some(&(delta, _)) = self.entries.front() {
                if self.base_ms + delta as u64 >= cutoff {
                    break;
                }
                self.entries.pop_front();
            }
        }
        while self.entries.len() > self.max_elements {
            self.entries.pop_front();
        }
    }

    /// Shift the base to `new_base_ms`, dropping elements that would
    /// land before it.
    fn rebase(&mut self, new_base_ms: u64) {
        let old_base = self.base_ms;
        self.base_ms = new_base_ms;
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for (delta, value) in self.entries.drain(..) {
            let absolute = old_base + delta as u64;
            if absolute >= new_base_ms {
                kept.push_back(((absolute - new_base_ms) as u32, value));
            }
        }
        self.entries = kept;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Timestamp of the newest element, if any.
    pub fn newest_ms(&self) -> Option<u64> {
        self.entries.back().map(|&(d, _)| self.base_ms + d as u64)
    }

    /// Timestamp of the oldest element, if any.
    pub fn oldest_ms(&self) -> Option<u64> {
        self.entries.front().map(|&(d, _)| self.base_ms + d as u64)
    }

    /// Iterate `(timestamp_ms, &T)` oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.entries
            .iter()
            .map(move |(d, v)| (self.base_ms + *d as u64, v))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_usage(&self) -> usize {
        self.entries.capacity() * (std::mem::size_of::<(u32, T)>())
    }

    /// Release spare capacity.
    pub fn compact(&mut self) -> usize {
        let before = self.entries.capacity();
        self.entries.shrink_to_fit();
        (before - self.entries.capacity()) * std::mem::size_of::<(u32, T)>()
    }
}

impl TimestampWindow {
    /// Insert a bare timestamp.
    pub fn record(&mut self, timestamp_ms: u64) {
        self.insert(timestamp_ms, ());
    }

    /// Count of timestamps currently inside the window relative to
    /// `now_ms`, pruning first.
    pub fn count_at(&mut self, now_ms: u64) -> usize {
        self.prune(now_ms);
        self.len()
    }
}
