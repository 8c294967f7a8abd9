//! JSON view types for the operational HTTP surface.
//!
//! The web crate reads these through shared handles; everything here
//! is a copied-out snapshot, never a live reference into engine state.

use serde::Serialize;

use crate::analysis::EngineStats;
use crate::memory::MemoryStats;
use crate::model::Alert;

/// One alert as served by `/api/v1/operations/alerts`.
#[derive(Clone, Debug, Serialize)]
pub struct AlertView {
    pub timestamp_ms: u64,
    pub alert_reason: String,
    pub detection_tier: &'static str,
    pub suggested_action: &'static str,
    pub anomaly_score: f64,
    pub offending_key: String,
    pub source_ip: String,
    pub request_path: String,
    pub log_line: u64,
}

impl From<&Alert> for AlertView {
    fn from(alert: &Alert) -> Self {
        Self {
            timestamp_ms: alert.timestamp_ms,
            alert_reason: alert.reason.clone(),
            detection_tier: alert.tier.as_str(),
            suggested_action: alert.action.as_str(),
            anomaly_score: alert.score,
            offending_key: alert.offending_key.clone(),
            source_ip: alert.source_ip.clone(),
            request_path: alert.event.record.path.clone(),
            log_line: alert.log_line,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TopIpEntry {
    pub ip: String,
    pub count: u64,
}

/// `/api/v1/operations/state` payload.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStateView {
    pub total_processed: u64,
    pub total_dropped: u64,
    pub max_timestamp_ms: u64,
    pub pressure_mode: bool,
    pub interned_strings: usize,
    pub ip_states: usize,
    pub path_states: usize,
    pub session_states: usize,
    pub top_active_ips: Vec<TopIpEntry>,
    pub top_error_ips: Vec<TopIpEntry>,
}

impl EngineStateView {
    pub fn build(
        stats: EngineStats,
        table_sizes: (usize, usize, usize),
        top_active: Vec<(String, u64)>,
        top_errors: Vec<(String, u64)>,
    ) -> Self {
        let entry = |(ip, count)| TopIpEntry { ip, count };
        Self {
            total_processed: stats.total_processed,
            total_dropped: stats.total_dropped,
            max_timestamp_ms: stats.max_timestamp_ms,
            pressure_mode: stats.pressure_mode,
            interned_strings: stats.interned_strings,
            ip_states: table_sizes.0,
            path_states: table_sizes.1,
            session_states: table_sizes.2,
            top_active_ips: top_active.into_iter().map(entry).collect(),
            top_error_ips: top_errors.into_iter().map(entry).collect(),
        }
    }
}

/// Memory block of the performance snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct MemoryView {
    pub usage_bytes: usize,
    pub limit_bytes: usize,
    pub pressure_level: &'static str,
    pub total_compactions: u64,
    pub total_evictions: u64,
    pub bytes_freed_by_compaction: u64,
    pub bytes_freed_by_eviction: u64,
}

impl From<&MemoryStats> for MemoryView {
    fn from(stats: &MemoryStats) -> Self {
        Self {
            usage_bytes: stats.total_usage,
            limit_bytes: stats.limit,
            pressure_level: stats.level.as_str(),
            total_compactions: stats.total_compactions,
            total_evictions: stats.total_evictions,
            bytes_freed_by_compaction: stats.bytes_freed_by_compaction,
            bytes_freed_by_eviction: stats.bytes_freed_by_eviction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertAction, AlertTier, AnalyzedEvent, LogRecord};
    use std::sync::Arc;

    #[test]
    fn test_alert_view_serializes() {
        let line = "1.2.3.4 - - [01/Jan/2026:00:00:00 +0000] \"GET /p HTTP/1.1\" 200 1 \"-\" \"ua\"";
        let event = Arc::new(AnalyzedEvent::new(Arc::new(
            LogRecord::parse(line, 5).unwrap(),
        )));
        let alert = Alert::new(event, "r", AlertTier::Tier2Statistical, AlertAction::Log, 0.4);
        let view = AlertView::from(&alert);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["detection_tier"], "TIER2_STATISTICAL");
        assert_eq!(json["request_path"], "/p");
        assert_eq!(json["log_line"], 5);
    }

    #[test]
    fn test_engine_state_view_shape() {
        let view = EngineStateView::build(
            EngineStats::default(),
            (1, 2, 3),
            vec![("1.2.3.4".to_string(), 9)],
            vec![],
        );
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["ip_states"], 1);
        assert_eq!(json["top_active_ips"][0]["ip"], "1.2.3.4");
        assert!(json["top_error_ips"].as_array().unwrap().is_empty());
    }
}
