//! Tier 2 — statistical z-score detector.
//!
//! Fires when any of the eight tracked features (duration, bytes,
//! error rate, request volume; each against per-IP and per-path
//! history) deviates beyond the configured threshold. Multiple signals
//! on one event coalesce into a single alert citing the
//! highest-magnitude feature.

use std::sync::Arc;

use super::DetectionTier;
use crate::config::Tier2Config;
use crate::model::{Alert, AlertAction, AlertTier, AnalyzedEvent};

pub struct StatisticalTier {
    cfg: Tier2Config,
}

impl StatisticalTier {
    pub fn new(cfg: Tier2Config) -> Self {
        Self { cfg }
    }

    /// `min(1, |z| / threshold)` squashed by a logistic centered at
    /// 0.5, keeping scores strictly inside (0, 1).
    fn normalized_score(&self, z: f64) -> f64 {
        let ratio = (z.abs() / self.cfg.z_score_threshold).min(1.0);
        1.0 / (1.0 + (-6.0 * (ratio - 0.5)).exp())
    }
}

/// Feature label + z value, for reason construction.
fn signals(event: &AnalyzedEvent) -> Vec<(&'static str, f64)> {
    let mut out = Vec::with_capacity(8);
    let mut push = |name, z: Option<f64>| {
        if let Some(z) = z {
            out.push((name, z));
        }
    };
    push("request duration vs IP history", event.ip_z.request_time);
    push("bytes sent vs IP history", event.ip_z.bytes_sent);
    push("error rate vs IP history", event.ip_z.error_rate);
    push("request volume vs IP history", event.ip_z.request_volume);
    push("request duration vs path history", event.path_z.request_time);
    push("bytes sent vs path history", event.path_z.bytes_sent);
    push("error rate vs path history", event.path_z.error_rate);
    push("request volume vs path history", event.path_z.request_volume);
    out
}

impl DetectionTier for StatisticalTier {
    fn name(&self) -> &'static str {
        "tier2"
    }

    fn evaluate(&mut self, event: &Arc<AnalyzedEvent>) -> Vec<Alert> {
        let threshold = self.cfg.z_score_threshold;
        let mut firing: Vec<(&'static str, f64)> = signals(event)
            .into_iter()
            .filter(|(_, z)| z.abs() >= threshold)
            .collect();
        if firing.is_empty() {
            return Vec::new();
        }

        firing.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let (feature, z) = firing[0];

        let reason = if firing.len() > 1 {
            format!(
                "Statistical anomaly: {feature} (z = {z:.2}; {} other signals)",
                firing.len() - 1
            )
        } else {
            format!("Statistical anomaly: {feature} (z = {z:.2})")
        };

        vec![Alert::new(
            Arc::clone(event),
            reason,
            AlertTier::Tier2Statistical,
            AlertAction::Log,
            self.normalized_score(z),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogRecord;

    fn event() -> AnalyzedEvent {
        let line = "1.2.3.4 - - [01/Jan/2026:00:00:00 +0000] \"GET /dl HTTP/1.1\" 200 1000000 \"-\" \"ua\"";
        AnalyzedEvent::new(Arc::new(LogRecord::parse(line, 1).unwrap()))
    }

    fn tier() -> StatisticalTier {
        StatisticalTier::new(Tier2Config::default())
    }

    #[test]
    fn test_below_threshold_is_quiet() {
        let mut t = tier();
        let mut e = event();
        e.ip_z.bytes_sent = Some(2.0);
        assert!(t.evaluate(&Arc::new(e)).is_empty());
    }

    #[test]
    fn test_unset_z_scores_are_quiet() {
        let mut t = tier();
        assert!(t.evaluate(&Arc::new(event())).is_empty());
    }

    #[test]
    fn test_fires_and_cites_bytes_feature() {
        let mut t = tier();
        let mut e = event();
        e.ip_z.bytes_sent = Some(5.4);
        let alerts = t.evaluate(&Arc::new(e));
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.tier, AlertTier::Tier2Statistical);
        assert_eq!(alert.action, AlertAction::Log);
        assert!(alert.reason.contains("bytes sent"));
        assert!(alert.score > 0.9, "score {} at z far beyond threshold", alert.score);
    }

    #[test]
    fn test_coalesces_citing_largest() {
        let mut t = tier();
        let mut e = event();
        e.ip_z.bytes_sent = Some(4.0);
        e.path_z.error_rate = Some(-8.0);
        e.ip_z.request_volume = Some(3.6);
        let alerts = t.evaluate(&Arc::new(e));
        assert_eq!(alerts.len(), 1, "signals coalesce into one alert");
        assert!(alerts[0].reason.contains("error rate vs path history"));
        assert!(alerts[0].reason.contains("2 other signals"));
    }

    #[test]
    fn test_negative_z_fires_on_magnitude() {
        let mut t = tier();
        let mut e = event();
        e.ip_z.request_time = Some(-3.6);
        assert_eq!(t.evaluate(&Arc::new(e)).len(), 1);
    }

    #[test]
    fn test_score_saturates_at_threshold_multiple() {
        let t = tier();
        // At exactly the threshold the ratio is 1.0.
        let at = t.normalized_score(3.5);
        let beyond = t.normalized_score(35.0);
        assert!((at - beyond).abs() < 1e-9, "ratio capped at 1");
        assert!(at > 0.9);
        assert!(t.normalized_score(0.0) < 0.1);
    }
}
