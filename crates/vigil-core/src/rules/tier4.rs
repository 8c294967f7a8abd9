//! Tier 4 — external metric correlation.
//!
//! Periodically renders the configured PromQL templates, queries a
//! Prometheus-compatible endpoint over a keep-alive HTTP agent and
//! compares the returned series against per-query thresholds. A
//! circuit breaker short-circuits queries while the endpoint is
//! failing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use super::DetectionTier;
use crate::config::Tier4Config;
use crate::model::{Alert, AlertAction, AlertTier, AnalyzedEvent};

// ============================================================
// Circuit breaker
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// CLOSED → OPEN on `failure_threshold` consecutive failures;
/// OPEN → HALF_OPEN once `timeout_ms` has elapsed; HALF_OPEN closes on
/// any success and reopens on any failure.
pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout_ms: u64,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at_ms: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout_ms: u64) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            timeout_ms,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at_ms: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a call may proceed at `now_ms`. Transitions OPEN →
    /// HALF_OPEN when the timeout has elapsed.
    pub fn allow(&mut self, now_ms: u64) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if now_ms.saturating_sub(self.opened_at_ms) >= self.timeout_ms {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    pub fn record_failure(&mut self, now_ms: u64) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at_ms = now_ms;
            }
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at_ms = now_ms;
                }
            }
            BreakerState::Open => {}
        }
    }
}

// ============================================================
// PromQL templates
// ============================================================

enum Segment {
    Literal(String),
    Param(String),
}

/// A `${name}`-style template, parsed once and rendered against a
/// parameter map per invocation.
pub struct PromTemplate {
    pub name: String,
    segments: Vec<Segment>,
}

impl PromTemplate {
    pub fn parse(name: &str, template: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            match rest[start + 2..].find('}') {
                Some(end) => {
                    segments.push(Segment::Param(rest[start + 2..start + 2 + end].to_string()));
                    rest = &rest[start + 2 + end + 1..];
                }
                None => {
                    // Unterminated placeholder; keep it literally.
                    segments.push(Segment::Literal(rest[start..].to_string()));
                    rest = "";
                }
            }
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Self {
            name: name.to_string(),
            segments,
        }
    }

    /// Render with missing parameters substituted as empty strings.
    pub fn render(&self, params: &HashMap<&str, &str>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Param(name) => {
                    out.push_str(params.get(name.as_str()).copied().unwrap_or(""))
                }
            }
        }
        out
    }
}

// ============================================================
// Query transport
// ============================================================

/// Prometheus instant-query response, decoded streaming from the
/// response body.
#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
}

#[derive(Debug, Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<PromSeries>,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    /// `[timestamp, "value"]`
    value: (f64, String),
}

/// Transport abstraction so the tier is testable without a live
/// endpoint.
pub trait QueryTransport: Send {
    /// Execute an instant query; returns the sample values.
    fn query(&self, promql: &str) -> Result<Vec<f64>, String>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
    endpoint: String,
}

impl UreqTransport {
    pub fn new(cfg: &Tier4Config) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(cfg.connect_timeout_seconds))
            .timeout_read(Duration::from_secs(cfg.read_timeout_seconds))
            .max_idle_connections(10)
            .max_idle_connections_per_host(10)
            .build();
        Self {
            agent,
            endpoint: cfg.endpoint_url.trim_end_matches('/').to_string(),
        }
    }
}

impl QueryTransport for UreqTransport {
    fn query(&self, promql: &str) -> Result<Vec<f64>, String> {
        let url = format!("{}/api/v1/query", self.endpoint);
        let response = self
            .agent
            .get(&url)
            .query("query", promql)
            .call()
            .map_err(|e| e.to_string())?;
        // Decode straight off the body reader; large result sets never
        // materialize as one string.
        let parsed: PromResponse =
            serde_json::from_reader(response.into_reader()).map_err(|e| e.to_string())?;
        if parsed.status != "success" {
            return Err(format!("query status {}", parsed.status));
        }
        let values = parsed
            .data
            .map(|d| {
                d.result
                    .iter()
                    .filter_map(|s| s.value.1.parse::<f64>().ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(values)
    }
}

// ============================================================
// The tier
// ============================================================

pub struct ExternalTier {
    cfg: Tier4Config,
    templates: Vec<PromTemplate>,
    thresholds: HashMap<String, f64>,
    breaker: CircuitBreaker,
    transport: Box<dyn QueryTransport>,
    last_eval_ms: u64,
}

impl ExternalTier {
    pub fn new(cfg: Tier4Config) -> Self {
        let transport = Box::new(UreqTransport::new(&cfg));
        Self::with_transport(cfg, transport)
    }

    pub fn with_transport(cfg: Tier4Config, transport: Box<dyn QueryTransport>) -> Self {
        let templates = cfg
            .query_templates
            .iter()
            .map(|(name, template)| PromTemplate::parse(name, template))
            .collect();
        let thresholds = cfg.anomaly_thresholds.iter().cloned().collect();
        let breaker = CircuitBreaker::new(
            cfg.circuit_breaker_failure_threshold,
            cfg.circuit_breaker_timeout_seconds * 1000,
        );
        Self {
            cfg,
            templates,
            thresholds,
            breaker,
            transport,
            last_eval_ms: 0,
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }
}

impl DetectionTier for ExternalTier {
    fn name(&self) -> &'static str {
        "tier4"
    }

    /// Runs at most once per evaluation interval, clocked on event
    /// time so replays behave deterministically.
    fn evaluate(&mut self, event: &Arc<AnalyzedEvent>) -> Vec<Alert> {
        let now = event.record.timestamp_ms;
        let interval_ms = self.cfg.evaluation_interval_seconds * 1000;
        if self.last_eval_ms != 0 && now.saturating_sub(self.last_eval_ms) < interval_ms {
            return Vec::new();
        }
        self.last_eval_ms = now;

        if !self.breaker.allow(now) {
            debug!("tier4 circuit open; skipping external queries");
            return Vec::new();
        }

        let record = &event.record;
        let params: HashMap<&str, &str> = HashMap::from([
            ("ip", record.ip.as_str()),
            ("host", record.host.as_str()),
            ("path", record.path.as_str()),
        ]);

        let mut alerts = Vec::new();
        for template in &self.templates {
            let promql = template.render(&params);
            match self.transport.query(&promql) {
                Ok(values) => {
                    self.breaker.record_success();
                    let Some(&threshold) = self.thresholds.get(&template.name) else {
                        continue;
                    };
                    for value in values {
                        if value >= threshold {
                            let score = (value / (threshold * 2.0)).clamp(0.0, 1.0);
                            alerts.push(
                                Alert::new(
                                    Arc::clone(event),
                                    format!(
                                        "External metric '{}' at {value:.2} (threshold {threshold:.2})",
                                        template.name
                                    ),
                                    AlertTier::Tier4External,
                                    AlertAction::Log,
                                    score,
                                )
                                .with_offending_key(template.name.clone()),
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!("tier4 query '{}' failed: {e}", template.name);
                    self.breaker.record_failure(now);
                    if self.breaker.state() == BreakerState::Open {
                        break;
                    }
                }
            }
        }
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogRecord;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_template_render() {
        let t = PromTemplate::parse(
            "err",
            r#"sum(rate(errors{host="${host}",path="${path}"}[5m]))"#,
        );
        let params = HashMap::from([("host", "shop.example"), ("path", "/x")]);
        assert_eq!(
            t.render(&params),
            r#"sum(rate(errors{host="shop.example",path="/x"}[5m]))"#
        );
    }

    #[test]
    fn test_template_missing_param_empty() {
        let t = PromTemplate::parse("q", "up{job=\"${job}\"}");
        assert_eq!(t.render(&HashMap::new()), "up{job=\"\"}");
    }

    #[test]
    fn test_template_unterminated_placeholder() {
        let t = PromTemplate::parse("q", "rate(x${oops");
        assert_eq!(t.render(&HashMap::new()), "rate(x${oops");
    }

    #[test]
    fn test_breaker_transitions() {
        let mut b = CircuitBreaker::new(5, 30_000);
        assert_eq!(b.state(), BreakerState::Closed);
        for i in 0..5 {
            assert!(b.allow(i));
            b.record_failure(i);
        }
        assert_eq!(b.state(), BreakerState::Open);
        // Short-circuits while the timeout runs.
        assert!(!b.allow(10_000));
        // After the timeout the next call probes.
        assert!(b.allow(31_000));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_breaker_half_open_failure_reopens() {
        let mut b = CircuitBreaker::new(1, 1_000);
        b.record_failure(0);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.allow(1_500));
        b.record_failure(1_500);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow(2_000));
        assert!(b.allow(2_600));
    }

    // ---- Tier behavior against a scripted transport ----

    struct ScriptedTransport {
        calls: Arc<AtomicU32>,
        results: Mutex<Vec<Result<Vec<f64>, String>>>,
    }

    impl QueryTransport for ScriptedTransport {
        fn query(&self, _promql: &str) -> Result<Vec<f64>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(Vec::new())
            } else {
                results.remove(0)
            }
        }
    }

    fn config() -> Tier4Config {
        Tier4Config {
            enabled: true,
            endpoint_url: "http://prom.test:9090".to_string(),
            query_templates: vec![("err_rate".to_string(), "errors{ip=\"${ip}\"}".to_string())],
            anomaly_thresholds: vec![("err_rate".to_string(), 50.0)],
            evaluation_interval_seconds: 60,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_timeout_seconds: 30,
            connect_timeout_seconds: 5,
            read_timeout_seconds: 30,
        }
    }

    fn event_at(ts_ms: u64) -> Arc<AnalyzedEvent> {
        let line = "1.2.3.4 - - [01/Jan/2026:00:00:00 +0000] \"GET /x HTTP/1.1\" 200 10 \"-\" \"ua\"";
        let mut record = LogRecord::parse(line, 1).unwrap();
        record.timestamp_ms = ts_ms;
        Arc::new(AnalyzedEvent::new(Arc::new(record)))
    }

    fn tier_with(results: Vec<Result<Vec<f64>, String>>) -> (ExternalTier, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let transport = ScriptedTransport {
            calls: Arc::clone(&calls),
            results: Mutex::new(results),
        };
        (
            ExternalTier::with_transport(config(), Box::new(transport)),
            calls,
        )
    }

    #[test]
    fn test_threshold_breach_alerts() {
        let (mut tier, _) = tier_with(vec![Ok(vec![75.0])]);
        let alerts = tier.evaluate(&event_at(1_000));
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.tier, AlertTier::Tier4External);
        assert!(alert.reason.contains("err_rate"));
        assert!(alert.reason.contains("75.00"));
        assert_eq!(alert.offending_key, "err_rate");
    }

    #[test]
    fn test_below_threshold_is_quiet() {
        let (mut tier, _) = tier_with(vec![Ok(vec![10.0])]);
        assert!(tier.evaluate(&event_at(1_000)).is_empty());
    }

    #[test]
    fn test_interval_gating() {
        let (mut tier, calls) = tier_with(vec![Ok(vec![10.0]), Ok(vec![10.0])]);
        tier.evaluate(&event_at(1_000));
        tier.evaluate(&event_at(30_000));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second event inside interval");
        tier.evaluate(&event_at(62_000));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_breaker_opens_then_recovers() {
        // Five failing rounds open the breaker; the sixth round does
        // no I/O; after the timeout a success closes it again.
        let mut cfg = config();
        cfg.circuit_breaker_timeout_seconds = 300;
        let mut results: Vec<Result<Vec<f64>, String>> = Vec::new();
        for _ in 0..5 {
            results.push(Err("connection refused".to_string()));
        }
        results.push(Ok(vec![75.0]));
        let calls = Arc::new(AtomicU32::new(0));
        let transport = ScriptedTransport {
            calls: Arc::clone(&calls),
            results: Mutex::new(results),
        };
        let mut tier = ExternalTier::with_transport(cfg, Box::new(transport));

        // Failures recorded at 0, 61 s, ... 244 s; the fifth opens it.
        for round in 0..5u64 {
            let alerts = tier.evaluate(&event_at(round * 61_000));
            assert!(alerts.is_empty());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(tier.breaker_state(), BreakerState::Open);

        // Inside the 300 s window: short-circuit, no transport call.
        tier.evaluate(&event_at(306_000));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // After the timeout the probe runs and succeeds.
        let alerts = tier.evaluate(&event_at(560_000));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(tier.breaker_state(), BreakerState::Closed);
        assert_eq!(alerts.len(), 1);
    }
}
