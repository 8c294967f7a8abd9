//! Analysis engine: per-event feature enrichment.
//!
//! For each incoming record the engine updates the per-IP, per-path
//! and per-session state, then emits an [`AnalyzedEvent`] carrying the
//! window counters, z-scores, first-sighting flags, UA classification,
//! substring-match results and (when Tier 3 or data collection is on)
//! the ordered feature vector.

pub mod ua;

use std::collections::HashMap;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::memory::MemoryManager;
use crate::ml::{FeatureManager, MlDataCollector};
use crate::model::{AnalyzedEvent, LogRecord};
use crate::model::event::ZScores;
use crate::state::{
    ManagedTable, PerIpState, PerPathState, PerSessionState, PressureRejected, session_key,
};
use crate::util::stats::CompactStatsTracker;
use crate::util::{StringInterner, fnv1a_32, ip_key};

/// How often expired sessions are swept, in event time.
const SESSION_EXPIRY_SWEEP_MS: u64 = 60_000;

/// Running totals exposed on the operational API.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    pub total_processed: u64,
    pub total_dropped: u64,
    pub max_timestamp_ms: u64,
    pub pressure_mode: bool,
    pub interned_strings: usize,
}

struct Matchers {
    suspicious_path: Option<AhoCorasick>,
    suspicious_ua: Option<AhoCorasick>,
    sensitive_path: Option<AhoCorasick>,
}

fn build_matcher(patterns: &[String]) -> Option<AhoCorasick> {
    if patterns.is_empty() {
        return None;
    }
    match AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(patterns)
    {
        Ok(ac) => Some(ac),
        Err(e) => {
            warn!("failed to build substring matcher: {e}");
            None
        }
    }
}

fn is_match(matcher: &Option<AhoCorasick>, haystack: &str) -> bool {
    matcher
        .as_ref()
        .map(|m| m.is_match(haystack))
        .unwrap_or(false)
}

pub struct AnalysisEngine {
    cfg: Arc<AppConfig>,
    memory: Arc<MemoryManager>,
    pub ip_states: Arc<ManagedTable<PerIpState>>,
    pub path_states: Arc<ManagedTable<PerPathState>>,
    pub session_states: Arc<ManagedTable<PerSessionState>>,
    interner: StringInterner,
    matchers: Matchers,
    feature_manager: FeatureManager,
    ml_collector: Option<MlDataCollector>,
    /// Whether feature vectors are built at all.
    build_features: bool,
    /// Table key -> interner id of the printable IP, for the API.
    ip_labels: HashMap<u64, u32>,
    pressure_mode: bool,
    total_processed: u64,
    total_dropped: u64,
    max_timestamp_ms: u64,
    last_session_sweep_ms: u64,
}

impl AnalysisEngine {
    pub fn new(cfg: Arc<AppConfig>, memory: Arc<MemoryManager>) -> Self {
        let ip_states = ManagedTable::new("ip_states", 3, cfg.max_ip_states);
        let path_states = ManagedTable::new("path_states", 2, cfg.max_path_states);
        let session_states = ManagedTable::new("session_states", 5, cfg.max_session_states);
        memory.register(Arc::downgrade(&ip_states) as _);
        memory.register(Arc::downgrade(&path_states) as _);
        memory.register(Arc::downgrade(&session_states) as _);

        let matchers = Matchers {
            suspicious_path: build_matcher(&cfg.tier1.suspicious_path_substrings),
            suspicious_ua: build_matcher(&cfg.tier1.suspicious_ua_substrings),
            sensitive_path: build_matcher(&cfg.tier1.sensitive_path_substrings),
        };

        let ml_collector = if cfg.ml_data_collection_enabled {
            info!(
                "ml data collection enabled, appending to {}",
                cfg.ml_data_collection_path
            );
            Some(MlDataCollector::new(std::path::Path::new(
                &cfg.ml_data_collection_path,
            )))
        } else {
            None
        };
        let build_features = cfg.tier3.enabled || cfg.ml_data_collection_enabled;

        Self {
            feature_manager: FeatureManager::new(cfg.tier3.feature_cache_ttl_seconds * 1000),
            ml_collector,
            build_features,
            cfg,
            memory,
            ip_states,
            path_states,
            session_states,
            interner: StringInterner::new(),
            matchers,
            ip_labels: HashMap::new(),
            pressure_mode: false,
            total_processed: 0,
            total_dropped: 0,
            max_timestamp_ms: 0,
            last_session_sweep_ms: 0,
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            total_processed: self.total_processed,
            total_dropped: self.total_dropped,
            max_timestamp_ms: self.max_timestamp_ms,
            pressure_mode: self.pressure_mode,
            interned_strings: self.interner.len(),
        }
    }

    pub fn interner(&self) -> &StringInterner {
        &self.interner
    }

    pub fn feature_manager_mut(&mut self) -> &mut FeatureManager {
        &mut self.feature_manager
    }

    /// Process a batch sequentially against the shared state. State
    /// updates are not commutative at millisecond resolution, so the
    /// order of `records` is preserved.
    pub fn process_batch(&mut self, records: Vec<LogRecord>) -> Vec<Arc<AnalyzedEvent>> {
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            match self.process(record) {
                Ok(event) => events.push(event),
                Err(PressureRejected) => {
                    self.total_dropped += 1;
                }
            }
        }
        if let Some(collector) = &mut self.ml_collector {
            for event in &events {
                collector.collect(event);
            }
        }
        events
    }

    /// Analyze one record. Returns `Err` when state allocation was
    /// rejected under critical memory pressure; the caller counts and
    /// skips the event.
    pub fn process(&mut self, record: LogRecord) -> Result<Arc<AnalyzedEvent>, PressureRejected> {
        self.total_processed += 1;
        let now = record.timestamp_ms;
        if now > self.max_timestamp_ms {
            self.max_timestamp_ms = now;
        }

        let pressure = self.memory.level();
        if pressure.is_pressure() {
            if !self.pressure_mode {
                self.pressure_mode = true;
                warn!("entering memory pressure mode ({})", pressure.as_str());
            }
            self.hibernate_inactive(now);
        } else if self.pressure_mode {
            self.pressure_mode = false;
            info!("leaving memory pressure mode");
        }

        self.sweep_sessions(now);

        let record = Arc::new(record);
        let ip_id = self.interner.intern(&record.ip);
        let _path_id = self.interner.intern(&record.path);
        let _ua_id = self.interner.intern(&record.user_agent);

        let tier1 = &self.cfg.tier1;
        let is_failed_login = tier1.failed_login_status_codes.contains(&record.status);
        let is_html = classify_html(tier1, record.path_without_query());
        let is_asset = classify_asset(tier1, record.path_without_query());

        let mut event = AnalyzedEvent::new(Arc::clone(&record));
        event.is_html_request = is_html;
        event.is_asset_request = is_asset;

        // Per-IP state.
        let ip_table_key = ip_key(&record.ip) as u64;
        {
            let mut ip_table = self.ip_states.lock();
            event.is_new_ip = ip_table.peek(ip_table_key).is_none();
            let ip_state = ip_table.get_or_create(ip_table_key, now, pressure, |created| {
                PerIpState::new(created, tier1)
            })?;

            event.is_path_new_for_ip = !ip_state.paths_seen.contains(&record.path);

            ip_state.touch(now);
            ip_state.mark_activity_hour(now);
            if is_failed_login {
                ip_state.failed_logins.record(now);
            }
            if is_html {
                ip_state.html_requests.record(now);
            }
            if is_asset {
                ip_state.asset_requests.record(now);
            }
            ip_state.paths_seen.insert(&record.path);
            ip_state.record_user_agent(now, &record.user_agent);

            event.requests_in_window = ip_state.requests.count_at(now);
            event.failed_logins_in_window = ip_state.failed_logins.count_at(now);
            event.html_requests_in_window = ip_state.html_requests.count_at(now);
            event.asset_requests_in_window = ip_state.asset_requests.count_at(now);

            ip_state.record_request_stats(
                record.request_time_s,
                record.bytes_sent,
                record.is_error(),
                event.requests_in_window,
            );

            event.ip_z = z_scores(
                &record,
                event.requests_in_window,
                self.cfg.tier2.min_samples_for_z_score,
                &ip_state.request_time,
                &ip_state.bytes_sent,
                &ip_state.error_rate,
                &ip_state.request_volume,
            );

            event.ua = ua::classify(&record.user_agent, tier1);
            let unique_uas = ip_state.unique_uas_in_window(now);
            event.ua.cycling = unique_uas > tier1.max_unique_uas_per_ip_in_window;
        }
        self.ip_labels.entry(ip_table_key).or_insert(ip_id);

        // Per-path state.
        let path_table_key = fnv1a_32(record.path_without_query().as_bytes()) as u64;
        {
            let mut path_table = self.path_states.lock();
            let path_state = path_table.get_or_create(path_table_key, now, pressure, |created| {
                PerPathState::new(created)
            })?;
            path_state.record_request(
                now,
                record.method.as_str(),
                record.query(),
                record.status,
                record.bytes_sent,
                record.request_time_s,
            );
            event.path_z = z_scores(
                &record,
                path_state.total_requests as usize,
                self.cfg.tier2.min_samples_for_z_score,
                &path_state.request_time,
                &path_state.bytes_sent,
                &path_state.error_rate,
                &path_state.request_volume,
            );
        }

        // Per-session state.
        if tier1.session_tracking_enabled {
            let key = session_key(&tier1.session_key_components, &record);
            let mut session_table = self.session_states.lock();
            let session = session_table.get_or_create(key, now, pressure, |created| {
                PerSessionState::new(created, tier1)
            })?;
            session.record(&record, is_failed_login);
            event.session = Some(session.snapshot(now));
        }

        // Substring scans.
        event.suspicious_path_found = is_match(&self.matchers.suspicious_path, &record.path);
        event.suspicious_ua_found = is_match(&self.matchers.suspicious_ua, &record.user_agent);
        event.sensitive_path_found = is_match(&self.matchers.sensitive_path, &record.path);
        event.ua.known_bad = event.suspicious_ua_found;

        if self.build_features {
            event.feature_vector = self.feature_manager.features_for(&event, now);
        }

        Ok(Arc::new(event))
    }

    fn hibernate_inactive(&mut self, now: u64) {
        let max_idle = self.cfg.state_max_idle_seconds * 1000;
        let hibernated = self.ip_states.lock().hibernate_inactive(now, max_idle)
            + self.path_states.lock().hibernate_inactive(now, max_idle)
            + self.session_states.lock().hibernate_inactive(now, max_idle);
        if hibernated > 0 {
            debug!("hibernated {hibernated} inactive states under pressure");
        }
    }

    /// Sessions expire on inactivity regardless of pressure.
    fn sweep_sessions(&mut self, now: u64) {
        if now.saturating_sub(self.last_session_sweep_ms) < SESSION_EXPIRY_SWEEP_MS {
            return;
        }
        self.last_session_sweep_ms = now;
        let ttl = self.cfg.tier1.session_inactivity_ttl_seconds * 1000;
        let expired = self.session_states.lock().expire_idle(now, ttl);
        if expired > 0 {
            debug!("expired {expired} idle sessions");
        }
    }

    /// Install per-IP states loaded from a snapshot.
    pub fn restore_ip_states(&mut self, entries: Vec<(u64, PerIpState)>, now_ms: u64) {
        let mut table = self.ip_states.lock();
        let count = entries.len();
        for (key, state) in entries {
            table.insert_state(key, state, now_ms);
        }
        info!("restored {count} per-IP states from snapshot");
    }

    /// Top-N IPs by in-window activity and by accumulated errors.
    pub fn top_ips(&self, limit: usize) -> (Vec<(String, u64)>, Vec<(String, u64)>) {
        let mut active: Vec<(String, u64)> = Vec::new();
        let mut errors: Vec<(String, u64)> = Vec::new();
        let table = self.ip_states.lock();
        table.for_each(|key, state| {
            // Restored states have no interned label yet; IPv4 keys
            // reconstruct from the packed form.
            let label = self
                .ip_labels
                .get(&key)
                .and_then(|&id| self.interner.get(id))
                .map(str::to_string)
                .unwrap_or_else(|| std::net::Ipv4Addr::from(key as u32).to_string());
            active.push((label.clone(), state.requests.len() as u64));
            let error_count = (state.error_rate.sum()).round() as u64;
            errors.push((label, error_count));
        });
        drop(table);

        active.sort_by(|a, b| b.1.cmp(&a.1));
        errors.sort_by(|a, b| b.1.cmp(&a.1));
        active.truncate(limit);
        errors.retain(|(_, n)| *n > 0);
        errors.truncate(limit);
        (active, errors)
    }
}

fn classify_html(cfg: &crate::config::Tier1Config, path: &str) -> bool {
    cfg.html_exact_paths.iter().any(|p| p == path)
        || cfg
            .html_path_suffixes
            .iter()
            .any(|s| path.ends_with(s.as_str()))
}

fn classify_asset(cfg: &crate::config::Tier1Config, path: &str) -> bool {
    cfg.asset_path_prefixes
        .iter()
        .any(|p| path.starts_with(p.as_str()))
        || cfg
            .asset_path_suffixes
            .iter()
            .any(|s| path.ends_with(s.as_str()))
}

/// Z-scores for one state's trackers, gated on the sample minimum.
fn z_scores(
    record: &LogRecord,
    requests_in_window: usize,
    min_samples: u64,
    request_time: &CompactStatsTracker,
    bytes_sent: &CompactStatsTracker,
    error_rate: &CompactStatsTracker,
    request_volume: &CompactStatsTracker,
) -> ZScores {
    let gate = |tracker: &CompactStatsTracker, sample: f64| -> Option<f64> {
        if tracker.count() < min_samples {
            return None;
        }
        tracker.z_score(sample)
    };
    ZScores {
        request_time: record.request_time_s.and_then(|t| gate(request_time, t)),
        // Trackers hold KB; the sample must match their scale.
        bytes_sent: gate(bytes_sent, record.bytes_sent as f64 / 1024.0),
        error_rate: gate(error_rate, if record.is_error() { 1.0 } else { 0.0 }),
        request_volume: gate(request_volume, requests_in_window as f64),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::MemoryManager;

    pub(crate) fn test_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.tier1.suspicious_path_substrings = vec!["/etc/passwd".into(), "wp-admin".into()];
        cfg.tier1.suspicious_ua_substrings = vec!["sqlmap".into(), "nikto".into()];
        cfg.tier1.sensitive_path_substrings = vec!["/admin".into()];
        cfg
    }

    pub(crate) fn engine_with(cfg: AppConfig) -> AnalysisEngine {
        let memory = Arc::new(MemoryManager::new(64 * 1024 * 1024));
        AnalysisEngine::new(Arc::new(cfg), memory)
    }

    pub(crate) fn line(
        ip: &str,
        ts_s: u64,
        path: &str,
        status: u16,
        bytes: u64,
        ua: &str,
    ) -> LogRecord {
        let line = format!(
            "{ip} - - [01/Jan/2026:00:00:00 +0000] \"GET {path} HTTP/1.1\" {status} {bytes} \"-\" \"{ua}\""
        );
        let mut r = LogRecord::parse(&line, 1).unwrap();
        r.timestamp_ms = ts_s * 1000;
        r
    }

    #[test]
    fn test_window_counter_grows() {
        let mut engine = engine_with(test_config());
        let first = engine
            .process(line("1.2.3.4", 10, "/a", 200, 100, "ua"))
            .unwrap();
        assert_eq!(first.requests_in_window, 1);
        assert!(first.is_new_ip);

        let second = engine
            .process(line("1.2.3.4", 11, "/a", 200, 100, "ua"))
            .unwrap();
        assert_eq!(second.requests_in_window, 2);
        assert!(!second.is_new_ip);
        assert!(!second.is_path_new_for_ip);
    }

    #[test]
    fn test_failed_login_window() {
        let mut engine = engine_with(test_config());
        engine
            .process(line("9.9.9.9", 1, "/login", 401, 10, "ua"))
            .unwrap();
        let e = engine
            .process(line("9.9.9.9", 2, "/login", 403, 10, "ua"))
            .unwrap();
        assert_eq!(e.failed_logins_in_window, 2);
    }

    #[test]
    fn test_substring_flags() {
        let mut engine = engine_with(test_config());
        let e = engine
            .process(line(
                "1.1.1.1",
                1,
                "/blog/wp-admin/setup.php",
                404,
                10,
                "Mozilla",
            ))
            .unwrap();
        assert!(e.suspicious_path_found);
        assert!(!e.suspicious_ua_found);

        let e = engine
            .process(line("1.1.1.1", 2, "/", 200, 10, "sqlmap/1.7"))
            .unwrap();
        assert!(e.suspicious_ua_found);
        assert!(e.ua.known_bad);
    }

    #[test]
    fn test_html_asset_classification() {
        let mut engine = engine_with(test_config());
        let e = engine
            .process(line("2.2.2.2", 1, "/index.html", 200, 10, "ua"))
            .unwrap();
        assert!(e.is_html_request);
        assert!(!e.is_asset_request);
        assert_eq!(e.html_requests_in_window, 1);

        let e = engine
            .process(line("2.2.2.2", 2, "/static/app.js?v=3", 200, 10, "ua"))
            .unwrap();
        assert!(e.is_asset_request);
        assert_eq!(e.asset_requests_in_window, 1);
    }

    #[test]
    fn test_z_scores_gated_by_min_samples() {
        let mut engine = engine_with(test_config());
        for i in 0..29 {
            let e = engine
                .process(line("3.3.3.3", i, "/p", 200, 1000, "ua"))
                .unwrap();
            assert!(e.ip_z.bytes_sent.is_none(), "below the sample minimum");
        }
        // 30th sample reaches the minimum; z is defined (may be small).
        let e = engine
            .process(line("3.3.3.3", 29, "/p", 200, 1010, "ua"))
            .unwrap();
        assert!(e.ip_z.bytes_sent.is_some());
    }

    #[test]
    fn test_bytes_spike_z_score() {
        // Warm an IP with 30 requests around 1000 bytes, then spike.
        let mut engine = engine_with(test_config());
        for i in 0..30u64 {
            let jitter = (i % 3) * 10;
            engine
                .process(line("4.4.4.4", i, "/p", 200, 995 + jitter, "ua"))
                .unwrap();
        }
        let e = engine
            .process(line("4.4.4.4", 31, "/p", 200, 1_000_000, "ua"))
            .unwrap();
        let z = e.ip_z.bytes_sent.expect("enough samples");
        assert!(z > 3.5, "spike z-score {z} should clear the threshold");
    }

    #[test]
    fn test_session_snapshot_attached() {
        let mut engine = engine_with(test_config());
        engine
            .process(line("5.5.5.5", 1, "/login", 401, 10, "ua-x"))
            .unwrap();
        let e = engine
            .process(line("5.5.5.5", 2, "/login", 401, 10, "ua-x"))
            .unwrap();
        let session = e.session.expect("session tracking on by default");
        assert_eq!(session.request_count, 2);
        assert_eq!(session.failed_logins, 2);
    }

    #[test]
    fn test_session_disabled() {
        let mut cfg = test_config();
        cfg.tier1.session_tracking_enabled = false;
        let mut engine = engine_with(cfg);
        let e = engine
            .process(line("6.6.6.6", 1, "/", 200, 1, "ua"))
            .unwrap();
        assert!(e.session.is_none());
    }

    #[test]
    fn test_ua_cycling_flag() {
        let mut cfg = test_config();
        cfg.tier1.max_unique_uas_per_ip_in_window = 2;
        let mut engine = engine_with(cfg);
        engine
            .process(line("7.7.7.7", 1, "/", 200, 1, "ua-1"))
            .unwrap();
        engine
            .process(line("7.7.7.7", 2, "/", 200, 1, "ua-2"))
            .unwrap();
        let e = engine
            .process(line("7.7.7.7", 3, "/", 200, 1, "ua-3"))
            .unwrap();
        assert!(e.ua.cycling);
    }

    #[test]
    fn test_stats_and_top_ips() {
        let mut engine = engine_with(test_config());
        engine
            .process(line("8.8.8.8", 1, "/", 200, 1, "ua"))
            .unwrap();
        engine
            .process(line("8.8.8.8", 2, "/x", 500, 1, "ua"))
            .unwrap();
        engine
            .process(line("9.9.9.9", 3, "/", 200, 1, "ua"))
            .unwrap();

        let stats = engine.stats();
        assert_eq!(stats.total_processed, 3);
        assert_eq!(stats.max_timestamp_ms, 3_000);

        let (active, errors) = engine.top_ips(10);
        assert_eq!(active[0].0, "8.8.8.8");
        assert_eq!(active[0].1, 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "8.8.8.8");
    }
}
