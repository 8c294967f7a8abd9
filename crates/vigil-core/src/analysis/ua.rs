//! User-agent classification.

use crate::config::Tier1Config;
use crate::model::UaFindings;

/// Parse the major version following `marker` (e.g. `Chrome/`).
fn major_version_after(ua: &str, marker: &str) -> Option<u32> {
    let pos = ua.find(marker)? + marker.len();
    let rest = &ua[pos..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Classify a user agent against the configured rules. Cycling is
/// decided by the caller from the IP's UA window and OR-ed in.
pub fn classify(ua: &str, cfg: &Tier1Config) -> UaFindings {
    let mut findings = UaFindings::default();

    if ua.is_empty() {
        findings.missing = true;
        return findings;
    }

    if !cfg.check_user_agent_anomalies {
        return findings;
    }

    findings.headless = cfg
        .headless_browser_strings
        .iter()
        .any(|needle| ua.contains(needle.as_str()));

    // `Edg/` and `OPR/` UAs carry a Chrome token with their own
    // versioning; only plain Chrome/Firefox are checked for staleness.
    if !ua.contains("Edg/") && !ua.contains("OPR/") {
        if let Some(major) = major_version_after(ua, "Chrome/")
            && major < cfg.min_chrome_version
        {
            findings.outdated_browser = true;
        }
        if let Some(major) = major_version_after(ua, "Firefox/")
            && major < cfg.min_firefox_version
        {
            findings.outdated_browser = true;
        }
    }

    findings
}
