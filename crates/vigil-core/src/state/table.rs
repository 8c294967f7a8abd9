//! Open-addressed state table with Robin-Hood probing.
//!
//! Keys are 64-bit (IPv4 packed to u32, path hashes, composed session
//! hashes). Entries carry an owned state payload, a hibernated flag and
//! a last-access stamp. Load factor is capped at 0.7; storage grows by
//! doubling; deletion backward-shifts the probe chain.

use crate::memory::PressureLevel;

/// `get_or_create` refused to allocate under CRITICAL pressure.
#[derive(Debug, PartialEq, Eq)]
pub struct PressureRejected;

impl std::fmt::Display for PressureRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "state allocation rejected under critical memory pressure")
    }
}

impl std::error::Error for PressureRejected {}

/// Behavior every table payload provides for memory accounting.
pub trait StateObject {
    fn memory_usage(&self) -> usize;
    /// Release spare capacity; returns bytes freed.
    fn compact(&mut self) -> usize;
}

struct Slot<S> {
    key: u64,
    /// Probe distance from the key's home bucket.
    dist: u16,
    hibernated: bool,
    last_access_ms: u64,
    /// `None` while hibernated.
    state: Option<S>,
}

const INITIAL_CAPACITY: usize = 16;
const LOAD_FACTOR: f64 = 0.7;
/// Hibernated entries untouched for this long are dropped by `compact`.
pub const COMPACT_HIBERNATED_AFTER_MS: u64 = 24 * 60 * 60 * 1000;

pub struct StateTable<S> {
    slots: Vec<Option<Slot<S>>>,
    len: usize,
    max_entries: usize,
}

/// splitmix64 finalizer; spreads sequential IPv4 keys across buckets.
fn mix(mut key: u64) -> u64 {
    key = key.wrapping_add(0x9e37_79b9_7f4a_7c15);
    key = (key ^ (key >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    key = (key ^ (key >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    key ^ (key >> 31)
}

impl<S: StateObject> StateTable<S> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            slots: (0..INITIAL_CAPACITY).map(|_| None).collect(),
            len: 0,
            max_entries: max_entries.max(INITIAL_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn home(&self, key: u64) -> usize {
        (mix(key) as usize) & (self.slots.len() - 1)
    }

    fn find_index(&self, key: u64) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut idx = self.home(key);
        let mut dist = 0u16;
        loop {
            match &self.slots[idx] {
                None => return None,
                Some(slot) => {
                    if slot.key == key {
                        return Some(idx);
                    }
                    // Robin-Hood invariant: a stored slot never sits
                    // closer to home than the key we are probing for.
                    if slot.dist < dist {
                        return None;
                    }
                }
            }
            idx = (idx + 1) & mask;
            dist += 1;
        }
    }

    /// Look up a key. On hit the access stamp is refreshed; a
    /// hibernated entry is resurrected with `revive(now_ms)`.
    pub fn find(&mut self, key: u64, now_ms: u64, revive: impl FnOnce(u64) -> S) -> Option<&mut S> {
        let idx = self.find_index(key)?;
        let slot = self.slots[idx].as_mut().expect("index points at occupied slot");
        slot.last_access_ms = now_ms;
        if slot.hibernated {
            slot.state = Some(revive(now_ms));
            slot.hibernated = false;
        }
        slot.state.as_mut()
    }

    /// Look up without resurrecting or touching the access stamp.
    pub fn peek(&self, key: u64) -> Option<&S> {
        let idx = self.find_index(key)?;
        self.slots[idx].as_ref().and_then(|s| s.state.as_ref())
    }

    /// Fetch or insert. Under reported pressure one LRU entry is
    /// evicted before any new allocation; under CRITICAL pressure a
    /// table that is still at its entry cap rejects the insert.
    pub fn get_or_create(
        &mut self,
        key: u64,
        now_ms: u64,
        pressure: PressureLevel,
        make: impl FnOnce(u64) -> S,
    ) -> Result<&mut S, PressureRejected> {
        if let Some(idx) = self.find_index(key) {
            let slot = self.slots[idx].as_mut().expect("occupied");
            slot.last_access_ms = now_ms;
            if slot.hibernated {
                slot.state = Some(make(now_ms));
                slot.hibernated = false;
            }
            return Ok(slot.state.as_mut().expect("resurrected"));
        }

        if pressure.is_pressure() {
            self.evict_lru(1);
        }
        if self.len >= self.max_entries {
            if pressure == PressureLevel::Critical {
                return Err(PressureRejected);
            }
            self.evict_lru(1);
        }
        if (self.len + 1) as f64 > self.slots.len() as f64 * LOAD_FACTOR {
            if pressure == PressureLevel::Critical {
                // No storage growth while critical; the caller drops
                // the event and counts it.
                return Err(PressureRejected);
            }
            self.grow();
        }

        self.insert_slot(Slot {
            key,
            dist: 0,
            hibernated: false,
            last_access_ms: now_ms,
            state: Some(make(now_ms)),
        });

        let idx = self.find_index(key).expect("just inserted");
        Ok(self.slots[idx]
            .as_mut()
            .and_then(|s| s.state.as_mut())
            .expect("just inserted"))
    }

    fn grow(&mut self) {
        let new_capacity = self.slots.len() * 2;
        self.rebuild(new_capacity);
    }

    fn rebuild(&mut self, new_capacity: usize) {
        let old = std::mem::replace(
            &mut self.slots,
            (0..new_capacity).map(|_| None).collect(),
        );
        self.len = 0;
        for slot in old.into_iter().flatten() {
            self.insert_slot(slot);
        }
    }

    fn insert_slot(&mut self, mut incoming: Slot<S>) {
        let mask = self.slots.len() - 1;
        let mut idx = self.home(incoming.key);
        let mut dist = 0u16;
        loop {
            match &mut self.slots[idx] {
                empty @ None => {
                    incoming.dist = dist;
                    *empty = Some(incoming);
                    self.len += 1;
                    return;
                }
                Some(existing) => {
                    if existing.key == incoming.key {
                        incoming.dist = existing.dist;
                        *existing = incoming;
                        return;
                    }
                    // Rob the rich: swap with entries probing shorter.
                    if existing.dist < dist {
                        incoming.dist = dist;
                        std::mem::swap(existing, &mut incoming);
                        dist = incoming.dist;
                    }
                }
            }
            idx = (idx + 1) & mask;
            dist += 1;
        }
    }

    /// Remove the entry at `idx` and backward-shift the chain.
    fn remove_at(&mut self, idx: usize) -> Option<Slot<S>> {
        let removed = self.slots[idx].take()?;
        self.len -= 1;
        let mask = self.slots.len() - 1;
        let mut hole = idx;
        loop {
            let next = (hole + 1) & mask;
            let shiftable = matches!(&self.slots[next], Some(slot) if slot.dist > 0);
            if !shiftable {
                break;
            }
            let mut moved = self.slots[next].take().expect("checked occupied");
            moved.dist -= 1;
            self.slots[hole] = Some(moved);
            hole = next;
        }
        Some(removed)
    }

    /// Insert a pre-built state (snapshot restore). Replaces any
    /// existing entry for the key.
    pub fn insert_state(&mut self, key: u64, state: S, now_ms: u64) {
        if self.len >= self.max_entries {
            self.evict_lru(1);
        }
        if (self.len + 1) as f64 > self.slots.len() as f64 * LOAD_FACTOR {
            self.grow();
        }
        self.insert_slot(Slot {
            key,
            dist: 0,
            hibernated: false,
            last_access_ms: now_ms,
            state: Some(state),
        });
    }

    pub fn remove(&mut self, key: u64) -> bool {
        match self.find_index(key) {
            Some(idx) => {
                self.remove_at(idx);
                true
            }
            None => false,
        }
    }

    /// Drop the payload of every live entry idle longer than
    /// `max_idle_ms`, keeping the key slot. Returns how many entries
    /// were hibernated.
    pub fn hibernate_inactive(&mut self, now_ms: u64, max_idle_ms: u64) -> usize {
        let mut hibernated = 0;
        for slot in self.slots.iter_mut().flatten() {
            if !slot.hibernated && now_ms.saturating_sub(slot.last_access_ms) > max_idle_ms {
                slot.state = None;
                slot.hibernated = true;
                hibernated += 1;
            }
        }
        hibernated
    }

    /// Remove the `count` entries with the oldest access stamps.
    /// Returns an estimate of the bytes freed.
    pub fn evict_lru(&mut self, count: usize) -> usize {
        if count == 0 || self.len == 0 {
            return 0;
        }
        let mut candidates: Vec<(u64, u64)> = self
            .slots
            .iter()
            .flatten()
            .map(|slot| (slot.last_access_ms, slot.key))
            .collect();
        candidates.sort_unstable();

        let mut freed = 0;
        for &(_, key) in candidates.iter().take(count) {
            if let Some(idx) = self.find_index(key)
                && let Some(slot) = self.remove_at(idx)
            {
                freed += slot.state.map(|s| s.memory_usage()).unwrap_or(0)
                    + std::mem::size_of::<Slot<S>>();
            }
        }
        freed
    }

    /// Remove entries idle longer than `ttl_ms` regardless of pressure
    /// (session inactivity expiry). Returns removed count.
    pub fn expire_idle(&mut self, now_ms: u64, ttl_ms: u64) -> usize {
        let expired: Vec<u64> = self
            .slots
            .iter()
            .flatten()
            .filter(|slot| now_ms.saturating_sub(slot.last_access_ms) > ttl_ms)
            .map(|slot| slot.key)
            .collect();
        let count = expired.len();
        for key in expired {
            self.remove(key);
        }
        count
    }

    /// Drop hibernated entries older than the 24 h threshold, compact
    /// surviving payloads and shrink sparse storage. Returns bytes
    /// freed (estimate).
    pub fn compact(&mut self, now_ms: u64) -> usize {
        let stale: Vec<u64> = self
            .slots
            .iter()
            .flatten()
            .filter(|slot| {
                slot.hibernated
                    && now_ms.saturating_sub(slot.last_access_ms) > COMPACT_HIBERNATED_AFTER_MS
            })
            .map(|slot| slot.key)
            .collect();
        let mut freed = stale.len() * std::mem::size_of::<Slot<S>>();
        for key in stale {
            self.remove(key);
        }

        for slot in self.slots.iter_mut().flatten() {
            if let Some(state) = slot.state.as_mut() {
                freed += state.compact();
            }
        }

        // Shrink when the table is mostly air.
        let mut capacity = self.slots.len();
        while capacity > INITIAL_CAPACITY && (self.len + 1) as f64 <= capacity as f64 * LOAD_FACTOR / 4.0
        {
            capacity /= 2;
        }
        if capacity < self.slots.len() {
            freed += (self.slots.len() - capacity) * std::mem::size_of::<Option<Slot<S>>>();
            self.rebuild(capacity);
        }
        freed
    }

    /// Total payload + slot memory, for the memory manager.
    pub fn memory_usage(&self) -> usize {
        let payloads: usize = self
            .slots
            .iter()
            .flatten()
            .filter_map(|slot| slot.state.as_ref())
            .map(|s| s.memory_usage())
            .sum();
        payloads + self.slots.capacity() * std::mem::size_of::<Option<Slot<S>>>()
    }

    /// Visit every live (non-hibernated) entry.
    pub fn for_each(&self, mut f: impl FnMut(u64, &S)) {
        for slot in self.slots.iter().flatten() {
            if let Some(state) = slot.state.as_ref() {
                f(slot.key, state);
            }
        }
    }

    #[cfg(test)]
    fn is_hibernated(&self, key: u64) -> Option<bool> {
        let idx = self.find_index(key)?;
        self.slots[idx].as_ref().map(|s| s.hibernated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestState {
        created_ms: u64,
        payload: Vec<u8>,
    }

    impl TestState {
        fn new(now: u64) -> Self {
            Self {
                created_ms: now,
                payload: vec![0; 64],
            }
        }
    }

    impl StateObject for TestState {
        fn memory_usage(&self) -> usize {
            self.payload.capacity()
        }
        fn compact(&mut self) -> usize {
            let before = self.payload.capacity();
            self.payload.shrink_to_fit();
            before - self.payload.capacity()
        }
    }

    fn table() -> StateTable<TestState> {
        StateTable::new(10_000)
    }

    #[test]
    fn test_insert_find_many() {
        let mut t = table();
        for key in 0..1_000u64 {
            t.get_or_create(key, key, PressureLevel::Normal, TestState::new)
                .unwrap();
        }
        assert_eq!(t.len(), 1_000);
        for key in 0..1_000u64 {
            let state = t.find(key, 2_000, TestState::new).unwrap();
            assert_eq!(state.created_ms, key);
        }
        assert!(t.find(5_000_000, 0, TestState::new).is_none());
    }

    #[test]
    fn test_load_factor_growth() {
        let mut t = table();
        for key in 0..100u64 {
            t.get_or_create(key, 0, PressureLevel::Normal, TestState::new)
                .unwrap();
        }
        assert!(t.capacity() >= 128);
        assert!((t.len() as f64) <= t.capacity() as f64 * 0.7);
    }

    #[test]
    fn test_remove_backward_shift() {
        let mut t = table();
        for key in 0..64u64 {
            t.get_or_create(key, 0, PressureLevel::Normal, TestState::new)
                .unwrap();
        }
        for key in (0..64u64).step_by(2) {
            assert!(t.remove(key));
        }
        assert_eq!(t.len(), 32);
        for key in (1..64u64).step_by(2) {
            assert!(t.find(key, 1, TestState::new).is_some(), "lost key {key}");
        }
        for key in (0..64u64).step_by(2) {
            assert!(t.find(key, 1, TestState::new).is_none());
        }
    }

    #[test]
    fn test_hibernate_and_resurrect() {
        // Created at t=0, hibernated at t=1500 with max_idle 1000,
        // resurrected by a find at t=2000.
        let mut t = table();
        t.get_or_create(42, 0, PressureLevel::Normal, TestState::new)
            .unwrap();
        let hibernated = t.hibernate_inactive(1_500, 1_000);
        assert_eq!(hibernated, 1);
        assert_eq!(t.is_hibernated(42), Some(true));

        let state = t.find(42, 2_000, TestState::new).unwrap();
        assert_eq!(state.created_ms, 2_000, "fresh state at resurrect time");
        assert_eq!(t.is_hibernated(42), Some(false));
    }

    #[test]
    fn test_hibernate_skips_recent() {
        let mut t = table();
        t.get_or_create(1, 1_000, PressureLevel::Normal, TestState::new)
            .unwrap();
        assert_eq!(t.hibernate_inactive(1_500, 1_000), 0);
    }

    #[test]
    fn test_evict_lru_order() {
        let mut t = table();
        for key in 0..10u64 {
            t.get_or_create(key, key * 100, PressureLevel::Normal, TestState::new)
                .unwrap();
        }
        let freed = t.evict_lru(3);
        assert!(freed > 0);
        assert_eq!(t.len(), 7);
        // Oldest three (keys 0..3 by access stamp) are gone.
        for key in 0..3u64 {
            assert!(t.peek(key).is_none());
        }
        assert!(t.peek(9).is_some());
    }

    #[test]
    fn test_pressure_evicts_before_insert() {
        let mut t = table();
        for key in 0..10u64 {
            t.get_or_create(key, key, PressureLevel::Normal, TestState::new)
                .unwrap();
        }
        t.get_or_create(100, 100, PressureLevel::High, TestState::new)
            .unwrap();
        // One LRU entry (key 0) was evicted to make room.
        assert_eq!(t.len(), 10);
        assert!(t.peek(0).is_none());
    }

    #[test]
    fn test_critical_evicts_then_inserts_without_growth() {
        let mut t: StateTable<TestState> = StateTable::new(16);
        for key in 0..11u64 {
            t.get_or_create(key, key, PressureLevel::Normal, TestState::new)
                .unwrap();
        }
        let capacity = t.capacity();
        // Critical pressure frees an LRU slot first, so the insert
        // lands without growing the storage.
        assert!(
            t.get_or_create(99, 99, PressureLevel::Critical, TestState::new)
                .is_ok()
        );
        assert_eq!(t.capacity(), capacity);
        assert!(t.find(99, 100, TestState::new).is_some());
    }

    #[test]
    fn test_expire_idle() {
        let mut t = table();
        t.get_or_create(1, 0, PressureLevel::Normal, TestState::new)
            .unwrap();
        t.get_or_create(2, 9_000, PressureLevel::Normal, TestState::new)
            .unwrap();
        let removed = t.expire_idle(10_000, 5_000);
        assert_eq!(removed, 1);
        assert!(t.peek(1).is_none());
        assert!(t.peek(2).is_some());
    }

    #[test]
    fn test_compact_drops_old_hibernated() {
        let mut t = table();
        t.get_or_create(7, 0, PressureLevel::Normal, TestState::new)
            .unwrap();
        t.hibernate_inactive(10_000, 1_000);
        let day = COMPACT_HIBERNATED_AFTER_MS;
        t.compact(day + 20_000);
        assert!(t.peek(7).is_none());
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_compact_shrinks_sparse_table() {
        let mut t = table();
        for key in 0..1_000u64 {
            t.get_or_create(key, 0, PressureLevel::Normal, TestState::new)
                .unwrap();
        }
        let grown = t.capacity();
        for key in 0..995u64 {
            t.remove(key);
        }
        t.compact(0);
        assert!(t.capacity() < grown);
        for key in 995..1_000u64 {
            assert!(t.peek(key).is_some());
        }
    }
}
