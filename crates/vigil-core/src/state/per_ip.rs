//! All state observed for one source IP.

use crate::config::Tier1Config;
use crate::state::table::StateObject;
use crate::util::bloom::BloomFilter;
use crate::util::stats::CompactStatsTracker;
use crate::util::window::TimestampWindow;

use std::collections::HashSet;

use xxhash_rust::xxh3::xxh3_64;

/// Threat flag bits.
pub mod threat_flags {
    pub const RATE_ABUSE: u8 = 1 << 0;
    pub const CREDENTIAL_STUFFING: u8 = 1 << 1;
    pub const SCRAPER: u8 = 1 << 2;
    pub const UA_ANOMALY: u8 = 1 << 3;
    pub const SUSPICIOUS_PATH: u8 = 1 << 4;
    pub const ML_FLAGGED: u8 = 1 << 5;
}

/// Hard cap on elements kept in each per-IP window.
const WINDOW_ELEMENT_CAP: usize = 5_000;
/// Cap on the exact confirmation reservoir behind each bloom filter.
const EXACT_RESERVOIR_CAP: usize = 1_000;
/// Expected distinct strings per IP for bloom sizing.
const BLOOM_EXPECTED: usize = 1_000;
const BLOOM_FP_RATE: f64 = 0.01;

/// Approximate string set: a bloom filter answers the common case and
/// a bounded exact reservoir (of xxh3 hashes) confirms positives while
/// it has not overflowed. Once the reservoir overflows, bloom positives
/// are trusted as-is.
#[derive(Debug)]
pub struct ApproxStringSet {
    bloom: BloomFilter<str>,
    exact: HashSet<u64>,
    overflowed: bool,
}

impl ApproxStringSet {
    pub fn new() -> Self {
        Self {
            bloom: BloomFilter::new(BLOOM_EXPECTED, BLOOM_FP_RATE),
            exact: HashSet::new(),
            overflowed: false,
        }
    }

    pub fn insert(&mut self, s: &str) {
        self.bloom.add(s);
        if self.exact.len() < EXACT_RESERVOIR_CAP {
            self.exact.insert(xxh3_64(s.as_bytes()));
        } else {
            self.overflowed = true;
        }
    }

    pub fn contains(&self, s: &str) -> bool {
        if !self.bloom.contains(s) {
            return false;
        }
        if self.overflowed {
            return true;
        }
        self.exact.contains(&xxh3_64(s.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.bloom.inserted() == 0
    }

    pub fn memory_usage(&self) -> usize {
        self.bloom.memory_usage() + self.exact.capacity() * std::mem::size_of::<u64>()
    }

    /// The underlying bloom filter, for persistence.
    pub fn bloom(&self) -> &BloomFilter<str> {
        &self.bloom
    }

    /// Rebuild from a persisted bloom body. The exact reservoir is not
    /// persisted, so the set starts in overflowed mode and trusts the
    /// filter's positives.
    pub fn from_bloom(bloom: BloomFilter<str>) -> Self {
        Self {
            bloom,
            exact: HashSet::new(),
            overflowed: true,
        }
    }

    fn compact(&mut self) -> usize {
        let before = self.exact.capacity();
        self.exact.shrink_to_fit();
        (before - self.exact.capacity()) * std::mem::size_of::<u64>()
    }
}

impl Default for ApproxStringSet {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct PerIpState {
    pub requests: TimestampWindow,
    pub failed_logins: TimestampWindow,
    pub html_requests: TimestampWindow,
    pub asset_requests: TimestampWindow,
    /// Distinct user agents seen inside the request window, for UA
    /// cycling detection. Values are xxh3 hashes.
    pub recent_uas: crate::util::window::SlidingWindow<u64>,

    pub paths_seen: ApproxStringSet,
    pub uas_seen: ApproxStringSet,

    pub request_time: CompactStatsTracker,
    pub bytes_sent: CompactStatsTracker,
    pub error_rate: CompactStatsTracker,
    pub request_volume: CompactStatsTracker,

    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub threat_flags: u8,
    /// 24 hours, one bit each.
    pub activity_pattern: [u8; 3],
    pub compaction_count: u16,
}

impl PerIpState {
    pub fn new(now_ms: u64, cfg: &Tier1Config) -> Self {
        let window_ms = cfg.sliding_window_duration_seconds * 1000;
        Self {
            requests: TimestampWindow::new(window_ms, WINDOW_ELEMENT_CAP),
            failed_logins: TimestampWindow::new(window_ms, WINDOW_ELEMENT_CAP),
            html_requests: TimestampWindow::new(window_ms, WINDOW_ELEMENT_CAP),
            asset_requests: TimestampWindow::new(window_ms, WINDOW_ELEMENT_CAP),
            recent_uas: crate::util::window::SlidingWindow::new(window_ms, 100),
            paths_seen: ApproxStringSet::new(),
            uas_seen: ApproxStringSet::new(),
            request_time: CompactStatsTracker::new(),
            bytes_sent: CompactStatsTracker::new(),
            error_rate: CompactStatsTracker::new(),
            request_volume: CompactStatsTracker::new(),
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            threat_flags: 0,
            activity_pattern: [0; 3],
            compaction_count: 0,
        }
    }

    /// Record a request's timestamp and refresh the first/last stamps.
    pub fn touch(&mut self, timestamp_ms: u64) {
        if timestamp_ms < self.first_seen_ms {
            self.first_seen_ms = timestamp_ms;
        }
        if timestamp_ms > self.last_seen_ms {
            self.last_seen_ms = timestamp_ms;
        }
        self.requests.record(timestamp_ms);
    }

    pub fn set_threat_flag(&mut self, flag: u8) {
        self.threat_flags |= flag;
    }

    pub fn has_threat_flag(&self, flag: u8) -> bool {
        self.threat_flags & flag != 0
    }

    /// Mark the hour-of-day bit for an event timestamp.
    pub fn mark_activity_hour(&mut self, timestamp_ms: u64) {
        let hour = (timestamp_ms / 3_600_000 % 24) as usize;
        self.activity_pattern[hour / 8] |= 1 << (hour % 8);
    }

    pub fn is_active_hour(&self, hour: usize) -> bool {
        let hour = hour % 24;
        self.activity_pattern[hour / 8] & (1 << (hour % 8)) != 0
    }

    /// Count of distinct user agents currently inside the UA window.
    pub fn unique_uas_in_window(&mut self, now_ms: u64) -> usize {
        self.recent_uas.prune(now_ms);
        let mut seen = HashSet::new();
        for (_, &hash) in self.recent_uas.iter() {
            seen.insert(hash);
        }
        seen.len()
    }

    pub fn record_user_agent(&mut self, timestamp_ms: u64, ua: &str) {
        self.recent_uas.insert(timestamp_ms, xxh3_64(ua.as_bytes()));
        self.uas_seen.insert(ua);
    }

    /// Update the per-IP trackers for one request. Bytes are tracked
    /// in KB so their squares stay inside the 32.32 fixed point.
    pub fn record_request_stats(
        &mut self,
        request_time_s: Option<f64>,
        bytes: u64,
        is_error: bool,
        requests_in_window: usize,
    ) {
        if let Some(t) = request_time_s {
            self.request_time.add(t);
        }
        self.bytes_sent.add(bytes as f64 / 1024.0);
        self.error_rate.add(if is_error { 1.0 } else { 0.0 });
        self.request_volume.add(requests_in_window as f64);
    }
}

impl StateObject for PerIpState {
    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.requests.memory_usage()
            + self.failed_logins.memory_usage()
            + self.html_requests.memory_usage()
            + self.asset_requests.memory_usage()
            + self.recent_uas.memory_usage()
            + self.paths_seen.memory_usage()
            + self.uas_seen.memory_usage()
    }

    fn compact(&mut self) -> usize {
        self.compaction_count = self.compaction_count.saturating_add(1);
        self.requests.compact()
            + self.failed_logins.compact()
            + self.html_requests.compact()
            + self.asset_requests.compact()
            + self.recent_uas.compact()
            + self.paths_seen.compact()
            + self.uas_seen.compact()
    }
}
