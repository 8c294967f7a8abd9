//! Per-session aggregates.
//!
//! The session key is a configurable composition (by default `ip` and
//! `ua`) hashed to 64 bits; see [`session_key`].

use crate::config::Tier1Config;
use crate::model::record::{HttpMethod, LogRecord};
use crate::model::event::SessionSnapshot;
use crate::state::table::StateObject;
use crate::util::bloom::BloomFilter;
use crate::util::window::TimestampWindow;

use std::collections::VecDeque;

use xxhash_rust::xxh3::xxh3_64;

const METHOD_SLOTS: usize = 16;
/// Recent path hashes kept exactly.
const PATH_RING_LEN: usize = 100;
/// Recent UA hashes kept exactly.
const UA_RING_LEN: usize = 10;
/// `(delta, path_hash)` request history entries.
const HISTORY_LEN: usize = 200;
const WINDOW_ELEMENT_CAP: usize = 2_000;

/// Compose the session key from the configured components.
pub fn session_key(components: &[String], record: &LogRecord) -> u64 {
    let mut buf = Vec::with_capacity(64);
    for component in components {
        match component.as_str() {
            "ip" => buf.extend_from_slice(record.ip.as_bytes()),
            "ua" => buf.extend_from_slice(record.user_agent.as_bytes()),
            "host" => buf.extend_from_slice(record.host.as_bytes()),
            "country" => buf.extend_from_slice(record.country_code.as_bytes()),
            _ => {}
        }
        buf.push(0x1f);
    }
    xxh3_64(&buf)
}

/// Bloom + bounded exact ring, used for both paths and user agents.
struct HashTracker {
    bloom: BloomFilter<u64>,
    ring: VecDeque<u64>,
    ring_cap: usize,
}

impl HashTracker {
    fn new(expected: usize, ring_cap: usize) -> Self {
        Self {
            bloom: BloomFilter::new(expected, 0.01),
            ring: VecDeque::with_capacity(ring_cap),
            ring_cap,
        }
    }

    /// Insert; returns true when the hash was not in the ring before
    /// (a "new" sighting at ring resolution).
    fn insert(&mut self, hash: u64) -> bool {
        let fresh = !self.ring.contains(&hash);
        self.bloom.add(&hash);
        if fresh {
            if self.ring.len() == self.ring_cap {
                self.ring.pop_front();
            }
            self.ring.push_back(hash);
        }
        fresh
    }

    fn contains(&self, hash: u64) -> bool {
        self.ring.contains(&hash) || self.bloom.contains(&hash)
    }

    fn memory_usage(&self) -> usize {
        self.bloom.memory_usage() + self.ring.capacity() * std::mem::size_of::<u64>()
    }
}

pub struct PerSessionState {
    pub started_ms: u64,
    pub last_seen_ms: u64,
    pub request_count: u64,
    pub failed_logins: u16,
    pub client_errors: u16,
    pub server_errors: u16,
    methods: [u16; METHOD_SLOTS],
    paths: HashTracker,
    uas: HashTracker,
    pub unique_ua_count: u8,
    /// `(delta_ms from session start, path_hash)`, most recent last.
    history: VecDeque<(u32, u64)>,
    pub window: TimestampWindow,
}

impl PerSessionState {
    pub fn new(now_ms: u64, cfg: &Tier1Config) -> Self {
        Self {
            started_ms: now_ms,
            last_seen_ms: now_ms,
            request_count: 0,
            failed_logins: 0,
            client_errors: 0,
            server_errors: 0,
            methods: [0; METHOD_SLOTS],
            paths: HashTracker::new(500, PATH_RING_LEN),
            uas: HashTracker::new(50, UA_RING_LEN),
            unique_ua_count: 0,
            history: VecDeque::with_capacity(HISTORY_LEN),
            window: TimestampWindow::new(
                cfg.sliding_window_duration_seconds * 1000,
                WINDOW_ELEMENT_CAP,
            ),
        }
    }

    pub fn record(&mut self, record: &LogRecord, is_failed_login: bool) {
        let now = record.timestamp_ms;
        self.request_count += 1;
        if now > self.last_seen_ms {
            self.last_seen_ms = now;
        }
        if is_failed_login {
            self.failed_logins = self.failed_logins.saturating_add(1);
        }
        match record.status {
            400..=499 => self.client_errors = self.client_errors.saturating_add(1),
            500..=599 => self.server_errors = self.server_errors.saturating_add(1),
            _ => {}
        }

        let slot = record.method.index().min(METHOD_SLOTS - 1);
        self.methods[slot] = self.methods[slot].saturating_add(1);

        let path_hash = xxh3_64(record.path.as_bytes());
        self.paths.insert(path_hash);

        if !record.user_agent.is_empty() {
            let ua_hash = xxh3_64(record.user_agent.as_bytes());
            if self.uas.insert(ua_hash) {
                self.unique_ua_count = self.unique_ua_count.saturating_add(1);
            }
        }

        let delta = now.saturating_sub(self.started_ms).min(u32::MAX as u64) as u32;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back((delta, path_hash));

        self.window.record(now);
    }

    pub fn method_count(&self, method: HttpMethod) -> u16 {
        self.methods[method.index().min(METHOD_SLOTS - 1)]
    }

    pub fn has_seen_path(&self, path: &str) -> bool {
        self.paths.contains(xxh3_64(path.as_bytes()))
    }

    /// Mean gap between consecutive requests in the retained history.
    pub fn mean_request_interval_ms(&self) -> f64 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let first = self.history.front().map(|&(d, _)| d).unwrap_or(0) as f64;
        let last = self.history.back().map(|&(d, _)| d).unwrap_or(0) as f64;
        (last - first).max(0.0) / (self.history.len() - 1) as f64
    }

    pub fn snapshot(&mut self, now_ms: u64) -> SessionSnapshot {
        SessionSnapshot {
            started_ms: self.started_ms,
            request_count: self.request_count,
            failed_logins: self.failed_logins,
            client_errors: self.client_errors,
            server_errors: self.server_errors,
            unique_user_agents: self.unique_ua_count,
            requests_in_window: self.window.count_at(now_ms),
            mean_request_interval_ms: self.mean_request_interval_ms(),
        }
    }
}

impl StateObject for PerSessionState {
    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.paths.memory_usage()
            + self.uas.memory_usage()
            + self.history.capacity() * std::mem::size_of::<(u32, u64)>()
            + self.window.memory_usage()
    }

    fn compact(&mut self) -> usize {
        self.window.compact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(ts: u64, ip: &str, ua: &str, status: u16, path: &str) -> Arc<LogRecord> {
        let line = format!(
            "{ip} - - [01/Jan/2026:00:00:00 +0000] \"GET {path} HTTP/1.1\" {status} 100 \"-\" \"{ua}\""
        );
        let mut r = LogRecord::parse(&line, 1).unwrap();
        r.timestamp_ms = ts;
        Arc::new(r)
    }

    #[test]
    fn test_session_key_composition() {
        let components = vec!["ip".to_string(), "ua".to_string()];
        let a = session_key(&components, &record(0, "1.1.1.1", "ua-a", 200, "/"));
        let b = session_key(&components, &record(0, "1.1.1.1", "ua-b", 200, "/"));
        let c = session_key(&components, &record(0, "1.1.1.1", "ua-a", 404, "/x"));
        assert_ne!(a, b, "different UA means different session");
        assert_eq!(a, c, "status and path are not key components");
    }

    #[test]
    fn test_counters() {
        let cfg = Tier1Config::default();
        let mut s = PerSessionState::new(0, &cfg);
        s.record(&record(1_000, "1.1.1.1", "ua", 200, "/a"), false);
        s.record(&record(2_000, "1.1.1.1", "ua", 401, "/login"), true);
        s.record(&record(3_000, "1.1.1.1", "ua", 503, "/a"), false);
        assert_eq!(s.request_count, 3);
        assert_eq!(s.failed_logins, 1);
        assert_eq!(s.client_errors, 1);
        assert_eq!(s.server_errors, 1);
        assert_eq!(s.method_count(HttpMethod::Get), 3);
        assert!(s.has_seen_path("/a"));
        assert!(!s.has_seen_path("/never"));
    }

    #[test]
    fn test_unique_ua_count() {
        let cfg = Tier1Config::default();
        let mut s = PerSessionState::new(0, &cfg);
        for ua in ["ua-1", "ua-2", "ua-1", "ua-3"] {
            s.record(&record(1_000, "1.1.1.1", ua, 200, "/"), false);
        }
        assert_eq!(s.unique_ua_count, 3);
    }

    #[test]
    fn test_history_bounded() {
        let cfg = Tier1Config::default();
        let mut s = PerSessionState::new(0, &cfg);
        for i in 0..300u64 {
            s.record(&record(i * 10, "1.1.1.1", "ua", 200, "/p"), false);
        }
        assert!(s.history.len() <= HISTORY_LEN);
    }

    #[test]
    fn test_mean_interval() {
        let cfg = Tier1Config::default();
        let mut s = PerSessionState::new(0, &cfg);
        for i in 0..5u64 {
            s.record(&record(i * 100, "1.1.1.1", "ua", 200, "/p"), false);
        }
        assert!((s.mean_request_interval_ms() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot() {
        let cfg = Tier1Config::default();
        let mut s = PerSessionState::new(500, &cfg);
        s.record(&record(1_000, "1.1.1.1", "ua", 401, "/login"), true);
        let snap = s.snapshot(1_000);
        assert_eq!(snap.started_ms, 500);
        assert_eq!(snap.request_count, 1);
        assert_eq!(snap.failed_logins, 1);
        assert_eq!(snap.requests_in_window, 1);
    }
}
