//! Per-path aggregates.

use crate::state::table::StateObject;
use crate::util::bloom::BloomFilter;
use crate::util::stats::CompactStatsTracker;

/// Path flag bits.
pub mod path_flags {
    pub const HAS_ANOMALY: u8 = 1 << 0;
    pub const HIGH_TRAFFIC: u8 = 1 << 1;
    pub const MONITORED: u8 = 1 << 2;
}

/// Recent responses kept per path.
const RESPONSE_RING_LEN: usize = 16;
/// Expected `method:query` patterns for bloom sizing.
const PATTERN_BLOOM_EXPECTED: usize = 2_000;

/// One recent response: status code and payload size in KB, saturated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecentResponse {
    pub status: u16,
    pub kb_sent: u16,
}

pub struct PerPathState {
    pub request_time: CompactStatsTracker,
    pub bytes_sent: CompactStatsTracker,
    pub error_rate: CompactStatsTracker,
    pub request_volume: CompactStatsTracker,

    /// `method:query` patterns observed on this path.
    pub patterns: BloomFilter<str>,
    responses: [RecentResponse; RESPONSE_RING_LEN],
    response_cursor: u8,
    response_len: u8,

    pub flags: u8,
    pub total_requests: u64,
    pub total_errors: u64,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

impl PerPathState {
    pub fn new(now_ms: u64) -> Self {
        Self {
            request_time: CompactStatsTracker::new(),
            bytes_sent: CompactStatsTracker::new(),
            error_rate: CompactStatsTracker::new(),
            request_volume: CompactStatsTracker::new(),
            patterns: BloomFilter::new(PATTERN_BLOOM_EXPECTED, 0.01),
            responses: [RecentResponse::default(); RESPONSE_RING_LEN],
            response_cursor: 0,
            response_len: 0,
            flags: 0,
            total_requests: 0,
            total_errors: 0,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
        }
    }

    pub fn record_request(
        &mut self,
        timestamp_ms: u64,
        method: &str,
        query: Option<&str>,
        status: u16,
        bytes: u64,
        request_time_s: Option<f64>,
    ) {
        self.total_requests += 1;
        let is_error = status >= 400;
        if is_error {
            self.total_errors += 1;
        }
        if timestamp_ms > self.last_seen_ms {
            self.last_seen_ms = timestamp_ms;
        }

        if let Some(t) = request_time_s {
            self.request_time.add(t);
        }
        // KB keeps the squares inside the 32.32 fixed point.
        self.bytes_sent.add(bytes as f64 / 1024.0);
        self.error_rate.add(if is_error { 1.0 } else { 0.0 });
        self.request_volume.add(self.total_requests as f64);

        let pattern = format!("{}:{}", method, query.unwrap_or(""));
        self.patterns.add(pattern.as_str());

        let kb = (bytes / 1024).min(u16::MAX as u64) as u16;
        self.responses[self.response_cursor as usize] = RecentResponse {
            status,
            kb_sent: kb,
        };
        self.response_cursor = (self.response_cursor + 1) % RESPONSE_RING_LEN as u8;
        self.response_len = (self.response_len + 1).min(RESPONSE_RING_LEN as u8);
    }

    pub fn has_seen_pattern(&self, method: &str, query: Option<&str>) -> bool {
        let pattern = format!("{}:{}", method, query.unwrap_or(""));
        self.patterns.contains(pattern.as_str())
    }

    /// Recent responses, newest first.
    pub fn recent_responses(&self) -> Vec<RecentResponse> {
        let len = self.response_len as usize;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let idx = (self.response_cursor as usize + RESPONSE_RING_LEN - 1 - i)
                % RESPONSE_RING_LEN;
            out.push(self.responses[idx]);
        }
        out
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn error_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_errors as f64 / self.total_requests as f64
    }
}

impl StateObject for PerPathState {
    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.patterns.memory_usage()
    }

    fn compact(&mut self) -> usize {
        // Fixed-size storage; nothing to release.
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_error_ratio() {
        let mut s = PerPathState::new(0);
        s.record_request(1_000, "GET", None, 200, 2048, Some(0.05));
        s.record_request(2_000, "GET", None, 500, 100, Some(0.2));
        assert_eq!(s.total_requests, 2);
        assert_eq!(s.total_errors, 1);
        assert_eq!(s.error_ratio(), 0.5);
        assert_eq!(s.last_seen_ms, 2_000);
    }

    #[test]
    fn test_pattern_bloom() {
        let mut s = PerPathState::new(0);
        s.record_request(1_000, "GET", Some("id=1"), 200, 10, None);
        assert!(s.has_seen_pattern("GET", Some("id=1")));
        assert!(!s.has_seen_pattern("DELETE", Some("id=1")));
    }

    #[test]
    fn test_response_ring_wraps() {
        let mut s = PerPathState::new(0);
        for i in 0..20u16 {
            s.record_request(i as u64, "GET", None, 200 + i, (i as u64) * 1024, None);
        }
        let recent = s.recent_responses();
        assert_eq!(recent.len(), RESPONSE_RING_LEN);
        // Newest first.
        assert_eq!(recent[0].status, 219);
        assert_eq!(recent[0].kb_sent, 19);
        assert_eq!(recent[15].status, 204);
    }

    #[test]
    fn test_flags() {
        let mut s = PerPathState::new(0);
        s.set_flag(path_flags::HIGH_TRAFFIC);
        assert!(s.has_flag(path_flags::HIGH_TRAFFIC));
        assert!(!s.has_flag(path_flags::HAS_ANOMALY));
    }
}
