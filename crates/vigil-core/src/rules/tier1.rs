//! Tier 1 — heuristic rules.
//!
//! Each rule produces a 0–100 score; the highest-scoring match wins
//! and determines the action band (<20 LOG, 20–50 CHALLENGE, 50–80
//! RATE_LIMIT, >=80 BLOCK). At most one alert is emitted per event.
//!
//! Window counters include the current request, so "more than the
//! limit" fires on the first request beyond it.

use std::sync::Arc;

use super::{DetectionTier, action_for_score};
use crate::config::Tier1Config;
use crate::model::{Alert, AlertTier, AnalyzedEvent};

/// Base score of the request-rate rule; escalates with overshoot.
const SCORE_RATE_BASE: f64 = 60.0;
/// Score of the per-IP failed-login rule (RATE_LIMIT band).
const SCORE_FAILED_LOGINS: f64 = 65.0;
/// Score of the asset/HTML ratio rule (LOG band).
const SCORE_ASSET_RATIO: f64 = 15.0;
/// Session-variant scores.
const SCORE_SESSION_FAILED_LOGINS: f64 = 65.0;
const SCORE_SESSION_REQUESTS: f64 = 55.0;
const SCORE_SESSION_UA_CHANGES: f64 = 85.0;

struct Candidate {
    score: f64,
    reason: String,
}

pub struct HeuristicTier {
    cfg: Tier1Config,
}

impl HeuristicTier {
    pub fn new(cfg: Tier1Config) -> Self {
        Self { cfg }
    }

    fn candidates(&self, event: &AnalyzedEvent) -> Vec<Candidate> {
        let cfg = &self.cfg;
        let mut out = Vec::new();

        // Request rate.
        if cfg.max_requests_per_ip_in_window > 0
            && event.requests_in_window > cfg.max_requests_per_ip_in_window
        {
            let excess = event.requests_in_window - cfg.max_requests_per_ip_in_window;
            out.push(Candidate {
                score: SCORE_RATE_BASE + 10.0 * excess as f64,
                reason: format!(
                    "High request rate: {} requests in window (limit {})",
                    event.requests_in_window, cfg.max_requests_per_ip_in_window
                ),
            });
        }

        // Failed logins per IP.
        if cfg.max_failed_logins_per_ip > 0
            && event.failed_logins_in_window > cfg.max_failed_logins_per_ip
        {
            out.push(Candidate {
                score: SCORE_FAILED_LOGINS,
                reason: format!(
                    "Excessive failed logins: {} in window (limit {})",
                    event.failed_logins_in_window, cfg.max_failed_logins_per_ip
                ),
            });
        }

        // User-agent anomalies: the configured adders accumulate.
        if cfg.check_user_agent_anomalies {
            let ua = &event.ua;
            let mut score = 0.0;
            let mut findings: Vec<&str> = Vec::new();
            if ua.missing {
                score += cfg.score_missing_ua;
                findings.push("missing");
            }
            if ua.known_bad {
                score += cfg.score_known_bad_ua;
                findings.push("known-bad");
            }
            if ua.headless {
                score += cfg.score_headless_browser;
                findings.push("headless");
            }
            if ua.outdated_browser {
                score += cfg.score_outdated_browser;
                findings.push("outdated");
            }
            if ua.cycling {
                score += cfg.score_ua_cycling;
                findings.push("cycling");
            }
            if !findings.is_empty() {
                out.push(Candidate {
                    score,
                    reason: format!("User-agent anomaly: {}", findings.join(", ")),
                });
            }
        }

        // Suspicious path substrings.
        if event.suspicious_path_found {
            out.push(Candidate {
                score: cfg.score_suspicious_path,
                reason: format!("Suspicious path requested: {}", event.record.path),
            });
        }

        // Sensitive path probed by a first-time IP.
        if event.sensitive_path_found && event.is_new_ip {
            out.push(Candidate {
                score: cfg.score_sensitive_path_new_ip,
                reason: format!("New IP probing sensitive path: {}", event.record.path),
            });
        }

        // Scraper heuristic: pages without their assets.
        if event.html_requests_in_window >= cfg.min_html_requests_for_ratio_check {
            let ratio =
                event.asset_requests_in_window as f64 / event.html_requests_in_window as f64;
            if ratio < cfg.min_assets_per_html_ratio {
                out.push(Candidate {
                    score: SCORE_ASSET_RATIO,
                    reason: format!(
                        "Scraper-like asset ratio: {:.1} assets per page (minimum {:.1})",
                        ratio, cfg.min_assets_per_html_ratio
                    ),
                });
            }
        }

        // Session variants.
        if cfg.session_tracking_enabled
            && let Some(session) = &event.session
        {
            if cfg.max_failed_logins_per_session > 0
                && session.failed_logins as u32 > cfg.max_failed_logins_per_session
            {
                out.push(Candidate {
                    score: SCORE_SESSION_FAILED_LOGINS,
                    reason: format!(
                        "Session failed logins: {} (limit {})",
                        session.failed_logins, cfg.max_failed_logins_per_session
                    ),
                });
            }
            if cfg.max_requests_per_session_in_window > 0
                && session.requests_in_window as u32 > cfg.max_requests_per_session_in_window
            {
                out.push(Candidate {
                    score: SCORE_SESSION_REQUESTS,
                    reason: format!(
                        "Session request rate: {} in window (limit {})",
                        session.requests_in_window, cfg.max_requests_per_session_in_window
                    ),
                });
            }
            if cfg.max_ua_changes_per_session > 0
                && session.unique_user_agents as u32 > cfg.max_ua_changes_per_session
            {
                out.push(Candidate {
                    score: SCORE_SESSION_UA_CHANGES,
                    reason: format!(
                        "Session user-agent changes: {} (limit {})",
                        session.unique_user_agents, cfg.max_ua_changes_per_session
                    ),
                });
            }
        }

        out
    }
}

impl DetectionTier for HeuristicTier {
    fn name(&self) -> &'static str {
        "tier1"
    }

    /// At most one alert per event; the best candidate wins.
    fn evaluate(&mut self, event: &Arc<AnalyzedEvent>) -> Vec<Alert> {
        let mut candidates = self.candidates(event);
        let Some(best) = candidates
            .iter_mut()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
        else {
            return Vec::new();
        };

        let score = best.score.clamp(0.0, 100.0);
        let action = action_for_score(score);
        let alert = Alert::new(
            Arc::clone(event),
            std::mem::take(&mut best.reason),
            AlertTier::Tier1Heuristic,
            action,
            score / 100.0,
        );
        vec![alert]
    }
}
