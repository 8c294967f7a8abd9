//! Per-record enrichment produced by the analysis engine and consumed
//! by the rule tiers.

use std::sync::Arc;

use super::record::LogRecord;

/// User-agent classification results for one event.
#[derive(Clone, Copy, Debug, Default)]
pub struct UaFindings {
    pub missing: bool,
    pub known_bad: bool,
    pub headless: bool,
    pub outdated_browser: bool,
    /// Distinct UA count within the IP's window exceeded the limit.
    pub cycling: bool,
}

/// Snapshot of the session state at the time of the event. The event
/// carries the values it needs; it never holds a pointer into the
/// session table.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionSnapshot {
    pub started_ms: u64,
    pub request_count: u64,
    pub failed_logins: u16,
    pub client_errors: u16,
    pub server_errors: u16,
    pub unique_user_agents: u8,
    pub requests_in_window: usize,
    /// Mean inter-request gap over the recent history, milliseconds.
    pub mean_request_interval_ms: f64,
}

/// Z-scores of the event against one state's history. Unset when the
/// backing tracker has fewer than the configured minimum samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZScores {
    pub request_time: Option<f64>,
    pub bytes_sent: Option<f64>,
    pub error_rate: Option<f64>,
    pub request_volume: Option<f64>,
}

/// The log record plus everything derived from state at ingest time.
#[derive(Clone, Debug)]
pub struct AnalyzedEvent {
    pub record: Arc<LogRecord>,

    // Counters copied from the per-IP sliding windows.
    pub requests_in_window: usize,
    pub failed_logins_in_window: usize,
    pub html_requests_in_window: usize,
    pub asset_requests_in_window: usize,

    pub ip_z: ZScores,
    pub path_z: ZScores,

    /// First request ever observed from this IP.
    pub is_new_ip: bool,
    /// This IP has not requested this path before.
    pub is_path_new_for_ip: bool,

    pub ua: UaFindings,
    /// Aho-Corasick hit on the suspicious-path table.
    pub suspicious_path_found: bool,
    /// Aho-Corasick hit on the suspicious-UA table.
    pub suspicious_ua_found: bool,
    /// Aho-Corasick hit on the sensitive-path table.
    pub sensitive_path_found: bool,

    pub is_html_request: bool,
    pub is_asset_request: bool,

    pub session: Option<SessionSnapshot>,

    /// Ordered feature vector for ML inference; empty when Tier 3 is
    /// disabled.
    pub feature_vector: Vec<f32>,
}

impl AnalyzedEvent {
    pub fn new(record: Arc<LogRecord>) -> Self {
        Self {
            record,
            requests_in_window: 0,
            failed_logins_in_window: 0,
            html_requests_in_window: 0,
            asset_requests_in_window: 0,
            ip_z: ZScores::default(),
            path_z: ZScores::default(),
            is_new_ip: false,
            is_path_new_for_ip: false,
            ua: UaFindings::default(),
            suspicious_path_found: false,
            suspicious_ua_found: false,
            sensitive_path_found: false,
            is_html_request: false,
            is_asset_request: false,
            session: None,
            feature_vector: Vec::new(),
        }
    }
}
