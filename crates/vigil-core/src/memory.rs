//! Global memory pressure tracking.
//!
//! Components register weak references; a background loop polls total
//! usage every 5 s, classifies pressure against the configured limit
//! and drives compaction and eviction. Actions are cumulative: MEDIUM
//! compacts, HIGH also evicts ~5% of the limit, CRITICAL ~15%.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Poll cadence of the background loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pressure bands over `usage / limit`. Monotonic in the ratio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    /// 0.40 watermark: elevated but no action yet.
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    pub fn classify(ratio: f64) -> Self {
        if ratio >= 0.90 {
            Self::Critical
        } else if ratio >= 0.75 {
            Self::High
        } else if ratio >= 0.60 {
            Self::Medium
        } else if ratio >= 0.40 {
            Self::Low
        } else {
            Self::Normal
        }
    }

    /// Threshold at which the engine and state tables start shedding.
    pub fn is_pressure(self) -> bool {
        self >= Self::Medium
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Normal,
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::Critical,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

/// Contract for anything the memory manager can account and shed.
pub trait ManagedComponent: Send + Sync {
    fn name(&self) -> &str;
    fn current_memory_usage(&self) -> usize;
    /// Release spare capacity; returns bytes freed.
    fn compact(&self) -> usize;
    /// Notification of the current pressure band.
    fn on_pressure(&self, level: PressureLevel);
    fn can_evict(&self) -> bool;
    /// 1 = keep longest, 10 = evict first.
    fn priority(&self) -> u8;
    /// Shed roughly `target_bytes`; returns bytes actually freed.
    fn evict(&self, target_bytes: usize) -> usize;
    /// Milliseconds since this component was last touched, for the
    /// eviction age factor. Components without a notion of age return 0.
    fn idle_ms(&self) -> u64 {
        0
    }
}

pub struct MemoryStats {
    pub total_usage: usize,
    pub limit: usize,
    pub level: PressureLevel,
    pub total_compactions: u64,
    pub total_evictions: u64,
    pub bytes_freed_by_compaction: u64,
    pub bytes_freed_by_eviction: u64,
}

pub struct MemoryManager {
    limit_bytes: usize,
    components: Mutex<Vec<Weak<dyn ManagedComponent>>>,
    level: AtomicU8,
    total_compactions: AtomicU64,
    total_evictions: AtomicU64,
    bytes_freed_by_compaction: AtomicU64,
    bytes_freed_by_eviction: AtomicU64,
}

impl MemoryManager {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit_bytes: limit_bytes.max(1),
            components: Mutex::new(Vec::new()),
            level: AtomicU8::new(0),
            total_compactions: AtomicU64::new(0),
            total_evictions: AtomicU64::new(0),
            bytes_freed_by_compaction: AtomicU64::new(0),
            bytes_freed_by_eviction: AtomicU64::new(0),
        }
    }

    pub fn register(&self, component: Weak<dyn ManagedComponent>) {
        self.components.lock().unwrap().push(component);
    }

    /// Sum of usage across registered components; drops dead weak refs.
    pub fn total_usage(&self) -> usize {
        let mut components = self.components.lock().unwrap();
        components.retain(|w| w.strong_count() > 0);
        components
            .iter()
            .filter_map(Weak::upgrade)
            .map(|c| c.current_memory_usage())
            .sum()
    }

    pub fn limit(&self) -> usize {
        self.limit_bytes
    }

    /// Last classified pressure level (cheap; read on the hot path).
    pub fn level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn is_pressure(&self) -> bool {
        self.level().is_pressure()
    }

    /// One poll cycle: recompute usage, reclassify, act on transitions.
    pub fn poll(&self) -> PressureLevel {
        let usage = self.total_usage();
        let ratio = usage as f64 / self.limit_bytes as f64;
        let level = PressureLevel::classify(ratio);
        let previous = PressureLevel::from_u8(self.level.swap(level.as_u8(), Ordering::Relaxed));

        if level != previous {
            if level > previous {
                warn!(
                    "memory pressure {} -> {} ({} / {} bytes)",
                    previous.as_str(),
                    level.as_str(),
                    usage,
                    self.limit_bytes
                );
            } else {
                info!(
                    "memory pressure eased {} -> {}",
                    previous.as_str(),
                    level.as_str()
                );
            }
            self.notify(level);
        }

        match level {
            PressureLevel::Normal | PressureLevel::Low => {}
            PressureLevel::Medium => {
                self.trigger_compaction();
            }
            PressureLevel::High => {
                self.trigger_compaction();
                self.trigger_eviction(self.limit_bytes / 20);
            }
            PressureLevel::Critical => {
                self.trigger_compaction();
                self.trigger_eviction(self.limit_bytes * 15 / 100);
            }
        }
        level
    }

    fn notify(&self, level: PressureLevel) {
        let components = self.upgraded();
        for c in components {
            c.on_pressure(level);
        }
    }

    fn upgraded(&self) -> Vec<Arc<dyn ManagedComponent>> {
        self.components
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Invoke `compact` on every registered component.
    pub fn trigger_compaction(&self) -> usize {
        let mut freed = 0;
        for c in self.upgraded() {
            freed += c.compact();
        }
        self.total_compactions.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed_by_compaction
            .fetch_add(freed as u64, Ordering::Relaxed);
        debug!("compaction freed {freed} bytes");
        freed
    }

    /// Evict from candidates in descending score order until
    /// `target_bytes` is met. Score: `age_factor * size_mb * (10 - priority)`.
    pub fn trigger_eviction(&self, target_bytes: usize) -> usize {
        let mut candidates: Vec<(f64, Arc<dyn ManagedComponent>)> = self
            .upgraded()
            .into_iter()
            .filter(|c| c.can_evict())
            .map(|c| {
                let size_mb = c.current_memory_usage() as f64 / (1024.0 * 1024.0);
                let age_factor = 1.0 + c.idle_ms() as f64 / 60_000.0;
                let priority_factor = (10u8.saturating_sub(c.priority())) as f64;
                (age_factor * size_mb * priority_factor, c)
            })
            .collect();
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut freed = 0;
        for (_, c) in candidates {
            if freed >= target_bytes {
                break;
            }
            freed += c.evict(target_bytes - freed);
            self.total_evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_freed_by_eviction
            .fetch_add(freed as u64, Ordering::Relaxed);
        debug!("eviction freed {freed} of {target_bytes} requested bytes");
        freed
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_usage: self.total_usage(),
            limit: self.limit_bytes,
            level: self.level(),
            total_compactions: self.total_compactions.load(Ordering::Relaxed),
            total_evictions: self.total_evictions.load(Ordering::Relaxed),
            bytes_freed_by_compaction: self.bytes_freed_by_compaction.load(Ordering::Relaxed),
            bytes_freed_by_eviction: self.bytes_freed_by_eviction.load(Ordering::Relaxed),
        }
    }

    /// Spawn the background poll loop. The thread exits promptly once
    /// `running` is cleared.
    pub fn spawn(self: &Arc<Self>, running: Arc<AtomicBool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("vigil-memory".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    manager.poll();
                    let mut remaining = POLL_INTERVAL;
                    let step = Duration::from_millis(100);
                    while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
                        std::thread::sleep(step.min(remaining));
                        remaining = remaining.saturating_sub(step);
                    }
                }
            })
            .expect("spawn memory manager thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeComponent {
        usage: AtomicUsize,
        evictable: bool,
        priority: u8,
        compactions: AtomicUsize,
    }

    impl FakeComponent {
        fn new(usage: usize, evictable: bool, priority: u8) -> Arc<Self> {
            Arc::new(Self {
                usage: AtomicUsize::new(usage),
                evictable,
                priority,
                compactions: AtomicUsize::new(0),
            })
        }
    }

    impl ManagedComponent for FakeComponent {
        fn name(&self) -> &str {
            "fake"
        }
        fn current_memory_usage(&self) -> usize {
            self.usage.load(Ordering::Relaxed)
        }
        fn compact(&self) -> usize {
            self.compactions.fetch_add(1, Ordering::Relaxed);
            0
        }
        fn on_pressure(&self, _level: PressureLevel) {}
        fn can_evict(&self) -> bool {
            self.evictable
        }
        fn priority(&self) -> u8 {
            self.priority
        }
        fn evict(&self, target_bytes: usize) -> usize {
            let current = self.usage.load(Ordering::Relaxed);
            let freed = current.min(target_bytes);
            self.usage.store(current - freed, Ordering::Relaxed);
            freed
        }
    }

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(PressureLevel::classify(0.0), PressureLevel::Normal);
        assert_eq!(PressureLevel::classify(0.39), PressureLevel::Normal);
        assert_eq!(PressureLevel::classify(0.40), PressureLevel::Low);
        assert_eq!(PressureLevel::classify(0.60), PressureLevel::Medium);
        assert_eq!(PressureLevel::classify(0.75), PressureLevel::High);
        assert_eq!(PressureLevel::classify(0.90), PressureLevel::Critical);
        assert_eq!(PressureLevel::classify(5.0), PressureLevel::Critical);
    }

    #[test]
    fn test_classification_is_monotonic() {
        let mut previous = PressureLevel::Normal;
        for step in 0..200 {
            let level = PressureLevel::classify(step as f64 / 100.0);
            assert!(level >= previous);
            previous = level;
        }
    }

    #[test]
    fn test_poll_compacts_under_medium() {
        let manager = MemoryManager::new(1_000);
        let component = FakeComponent::new(650, false, 5);
        manager.register(Arc::downgrade(&component) as Weak<dyn ManagedComponent>);

        let level = manager.poll();
        assert_eq!(level, PressureLevel::Medium);
        assert_eq!(component.compactions.load(Ordering::Relaxed), 1);
        assert_eq!(manager.stats().total_compactions, 1);
    }

    #[test]
    fn test_critical_evicts_15_percent() {
        let manager = MemoryManager::new(1_000_000);
        let component = FakeComponent::new(950_000, true, 5);
        manager.register(Arc::downgrade(&component) as Weak<dyn ManagedComponent>);

        let level = manager.poll();
        assert_eq!(level, PressureLevel::Critical);
        let freed = 950_000 - component.current_memory_usage();
        assert_eq!(freed, 150_000);
    }

    #[test]
    fn test_eviction_prefers_low_priority() {
        let manager = MemoryManager::new(1_000_000);
        // Same size; priority 9 (evict first) vs 1 (keep longest).
        let disposable = FakeComponent::new(100_000, true, 9);
        let precious = FakeComponent::new(100_000, true, 1);
        manager.register(Arc::downgrade(&disposable) as Weak<dyn ManagedComponent>);
        manager.register(Arc::downgrade(&precious) as Weak<dyn ManagedComponent>);

        manager.trigger_eviction(50_000);
        assert!(disposable.current_memory_usage() < 100_000);
        assert_eq!(precious.current_memory_usage(), 100_000);
    }

    #[test]
    fn test_dead_components_are_dropped() {
        let manager = MemoryManager::new(1_000);
        let component = FakeComponent::new(500, false, 5);
        manager.register(Arc::downgrade(&component) as Weak<dyn ManagedComponent>);
        assert_eq!(manager.total_usage(), 500);
        drop(component);
        assert_eq!(manager.total_usage(), 0);
    }
}
