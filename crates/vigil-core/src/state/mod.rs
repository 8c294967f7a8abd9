//! Concurrent, memory-bounded state store.
//!
//! Three independently locked tables keyed by IP (u32), path hash
//! (FNV-1a u32) and session hash (xxh3 u64). The analysis thread locks
//! per event; the memory-manager thread takes the same locks briefly
//! for compaction and eviction. No table embeds pointers into another.

pub mod per_ip;
pub mod per_path;
pub mod per_session;
pub mod snapshot;
pub mod table;

pub use per_ip::PerIpState;
pub use per_path::PerPathState;
pub use per_session::{PerSessionState, session_key};
pub use table::{PressureRejected, StateObject, StateTable};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::memory::{ManagedComponent, PressureLevel};
use crate::util::now_ms;

/// A state table behind a mutex, registerable with the memory manager.
pub struct ManagedTable<S: StateObject> {
    name: &'static str,
    priority: u8,
    last_touched_ms: AtomicU64,
    inner: Mutex<StateTable<S>>,
}

impl<S: StateObject> ManagedTable<S> {
    pub fn new(name: &'static str, priority: u8, max_entries: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            priority,
            last_touched_ms: AtomicU64::new(now_ms()),
            inner: Mutex::new(StateTable::new(max_entries)),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, StateTable<S>> {
        self.last_touched_ms.store(now_ms(), Ordering::Relaxed);
        self.inner.lock().unwrap()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: StateObject + Send> ManagedComponent for ManagedTable<S> {
    fn name(&self) -> &str {
        self.name
    }

    fn current_memory_usage(&self) -> usize {
        self.inner.lock().unwrap().memory_usage()
    }

    fn compact(&self) -> usize {
        self.inner.lock().unwrap().compact(now_ms())
    }

    fn on_pressure(&self, _level: PressureLevel) {}

    fn can_evict(&self) -> bool {
        !self.inner.lock().unwrap().is_empty()
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn evict(&self, target_bytes: usize) -> usize {
        let mut table = self.inner.lock().unwrap();
        let mut freed = 0;
        // Evict in small LRU batches until the target is met or the
        // table runs dry.
        while freed < target_bytes && !table.is_empty() {
            let step = table.evict_lru(16);
            if step == 0 {
                break;
            }
            freed += step;
        }
        freed
    }

    fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_touched_ms.load(Ordering::Relaxed))
    }
}
