//! Alert record and its stable JSON representation.

use std::sync::Arc;

use serde_json::{Value, json};

use super::event::AnalyzedEvent;

/// Detection cascade level that produced an alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlertTier {
    Tier1Heuristic,
    Tier2Statistical,
    Tier3Ml,
    Tier4External,
}

impl AlertTier {
    /// Stable wire name used in alert JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tier1Heuristic => "TIER1_HEURISTIC",
            Self::Tier2Statistical => "TIER2_STATISTICAL",
            Self::Tier3Ml => "TIER3_ML",
            Self::Tier4External => "TIER4_EXTERNAL",
        }
    }

    /// Short label used in metric label values.
    pub fn label(self) -> &'static str {
        match self {
            Self::Tier1Heuristic => "tier1",
            Self::Tier2Statistical => "tier2",
            Self::Tier3Ml => "tier3",
            Self::Tier4External => "tier4",
        }
    }
}

/// Suggested mitigation, ordered by severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlertAction {
    NoAction,
    Log,
    Challenge,
    RateLimit,
    Block,
}

impl AlertAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoAction => "NO_ACTION",
            Self::Log => "LOG",
            Self::Challenge => "CHALLENGE",
            Self::RateLimit => "RATE_LIMIT",
            Self::Block => "BLOCK",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NoAction => "no_action",
            Self::Log => "log",
            Self::Challenge => "challenge",
            Self::RateLimit => "rate_limit",
            Self::Block => "block",
        }
    }
}

/// An emitted detection. Keeps the originating event (and through it
/// the record) alive for the sinks.
#[derive(Clone, Debug)]
pub struct Alert {
    pub event: Arc<AnalyzedEvent>,
    pub timestamp_ms: u64,
    pub source_ip: String,
    pub reason: String,
    pub tier: AlertTier,
    pub action: AlertAction,
    /// Normalized anomaly score in [0, 1]; 1 = high-confidence anomaly.
    pub score: f64,
    /// Key the detection is attributed to; defaults to the source IP.
    pub offending_key: String,
    pub log_line: u64,
    /// Truncated raw line for operator inspection.
    pub raw_sample: String,
    /// Contributing-feature description, set by Tier 3.
    pub feature_note: Option<String>,
}

impl Alert {
    pub fn new(
        event: Arc<AnalyzedEvent>,
        reason: impl Into<String>,
        tier: AlertTier,
        action: AlertAction,
        score: f64,
    ) -> Self {
        let record = &event.record;
        let source_ip = record.ip.clone();
        Self {
            timestamp_ms: record.timestamp_ms,
            source_ip: source_ip.clone(),
            reason: reason.into(),
            tier,
            action,
            score: score.clamp(0.0, 1.0),
            offending_key: source_ip,
            log_line: record.line_number,
            raw_sample: record.raw_sample.clone(),
            feature_note: None,
            event,
        }
    }

    pub fn with_offending_key(mut self, key: impl Into<String>) -> Self {
        self.offending_key = key.into();
        self
    }

    pub fn with_feature_note(mut self, note: impl Into<String>) -> Self {
        self.feature_note = Some(note.into());
        self
    }

    /// Throttle key: `source_ip + ":" + reason`.
    pub fn throttle_key(&self) -> String {
        format!("{}:{}", self.source_ip, self.reason)
    }

    /// The stable JSON shape written by the file sink and POSTed by the
    /// webhook sink.
    pub fn to_json(&self) -> Value {
        let record = &self.event.record;
        json!({
            "timestamp_ms": self.timestamp_ms,
            "alert_reason": self.reason,
            "detection_tier": self.tier.as_str(),
            "suggested_action": self.action.as_str(),
            "anomaly_score": self.score,
            "offending_key": self.offending_key,
            "log_context": {
                "source_ip": record.ip,
                "host": record.host,
                "request_path": record.path,
                "status_code": record.status,
                "user_agent": record.user_agent,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::LogRecord;

    fn event() -> Arc<AnalyzedEvent> {
        let line = "1.2.3.4 - - [01/Jan/2026:00:00:00 +0000] \"GET /admin HTTP/1.1\" 403 12 \"-\" \"curl/8.0\" host=example.org";
        let record = Arc::new(LogRecord::parse(line, 9).unwrap());
        Arc::new(AnalyzedEvent::new(record))
    }

    #[test]
    fn test_alert_defaults() {
        let a = Alert::new(
            event(),
            "Suspicious path",
            AlertTier::Tier1Heuristic,
            AlertAction::Block,
            1.4,
        );
        assert_eq!(a.source_ip, "1.2.3.4");
        assert_eq!(a.offending_key, "1.2.3.4");
        assert_eq!(a.score, 1.0, "score is clamped to [0, 1]");
        assert_eq!(a.log_line, 9);
        assert_eq!(a.throttle_key(), "1.2.3.4:Suspicious path");
    }

    #[test]
    fn test_alert_json_shape() {
        let a = Alert::new(
            event(),
            "High request rate",
            AlertTier::Tier2Statistical,
            AlertAction::Log,
            0.5,
        );
        let v = a.to_json();
        assert_eq!(v["detection_tier"], "TIER2_STATISTICAL");
        assert_eq!(v["suggested_action"], "LOG");
        assert_eq!(v["log_context"]["source_ip"], "1.2.3.4");
        assert_eq!(v["log_context"]["host"], "example.org");
        assert_eq!(v["log_context"]["status_code"], 403);
        assert_eq!(v["log_context"]["request_path"], "/admin");
    }

    #[test]
    fn test_action_ordering() {
        assert!(AlertAction::Block > AlertAction::RateLimit);
        assert!(AlertAction::RateLimit > AlertAction::Challenge);
        assert!(AlertAction::Challenge > AlertAction::Log);
        assert!(AlertAction::Log > AlertAction::NoAction);
    }
}
