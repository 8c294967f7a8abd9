//! End-to-end pipeline tests: source -> engine -> cascade -> alert
//! manager -> file sink.

use std::path::Path;
use std::sync::Arc;

use vigil_core::alerts::{AlertManager, Dispatcher};
use vigil_core::alerts::dispatch::FileDispatcher;
use vigil_core::analysis::AnalysisEngine;
use vigil_core::config::AppConfig;
use vigil_core::memory::MemoryManager;
use vigil_core::metrics::MetricsRegistry;
use vigil_core::model::AlertTier;
use vigil_core::rules::RuleEngine;
use vigil_core::source::{FileLogSource, LogSource};

fn write_log(path: &Path, lines: &[String]) {
    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(path, content).unwrap();
}

fn log_line(ip: &str, second: u64, path: &str, status: u16, ua: &str) -> String {
    // All within one minute so the sliding window sees every request.
    format!(
        "{ip} - - [01/Jan/2026:00:00:{second:02} +0000] \"GET {path} HTTP/1.1\" {status} 512 \"-\" \"{ua}\""
    )
}

fn pipeline(cfg: AppConfig) -> (AnalysisEngine, RuleEngine, AlertManager, Arc<MetricsRegistry>) {
    let cfg = Arc::new(cfg);
    let registry = Arc::new(MetricsRegistry::new());
    let memory = Arc::new(MemoryManager::new(256 * 1024 * 1024));
    let engine = AnalysisEngine::new(Arc::clone(&cfg), memory);
    let rules = RuleEngine::from_config(&cfg);
    let manager = AlertManager::new(
        &registry,
        cfg.alert_throttle_duration_seconds * 1000,
        cfg.alert_throttle_max_alerts,
        false,
    )
    .unwrap();
    (engine, rules, manager, registry)
}

#[test]
fn rate_limit_fires_end_to_end() {
    // Four requests from one IP against a window cap of three: only
    // the fourth produces a rate alert, and it lands in the NDJSON
    // sink via the dispatch thread.
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("access.log");
    let alert_path = dir.path().join("alerts.ndjson");

    let mut cfg = AppConfig::default();
    cfg.tier1.max_requests_per_ip_in_window = 3;
    cfg.tier2.enabled = false;
    let (mut engine, mut rules, manager, _registry) = pipeline(cfg);
    manager.start(vec![
        Box::new(FileDispatcher::open(&alert_path).unwrap()) as Box<dyn Dispatcher>,
    ]);

    let lines: Vec<String> = (0..4)
        .map(|i| log_line("1.2.3.4", i, "/", 200, "Mozilla/5.0 Chrome/120.0"))
        .collect();
    write_log(&log_path, &lines);

    let mut source = FileLogSource::open(&log_path, None).unwrap();
    let batch = source.next_batch().unwrap();
    assert_eq!(batch.records.len(), 4);

    let mut alerts_emitted = 0;
    for (idx, event) in engine.process_batch(batch.records).iter().enumerate() {
        for alert in rules.evaluate(event) {
            assert_eq!(idx, 3, "only the fourth event may alert");
            assert_eq!(alert.tier, AlertTier::Tier1Heuristic);
            assert!(alert.reason.to_lowercase().contains("rate"));
            assert_eq!(alert.source_ip, "1.2.3.4");
            alerts_emitted += 1;
            manager.record_alert(alert);
        }
    }
    assert_eq!(alerts_emitted, 1);

    manager.shutdown();
    let sink = std::fs::read_to_string(&alert_path).unwrap();
    let lines: Vec<&str> = sink.lines().collect();
    assert_eq!(lines.len(), 1);
    let json: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(json["detection_tier"], "TIER1_HEURISTIC");
    assert_eq!(json["log_context"]["source_ip"], "1.2.3.4");
}

#[test]
fn repeated_alerts_throttle_end_to_end() {
    // Two identical suspicious-path alerts 2 s apart inside a 10 s
    // throttle window: the second is suppressed.
    let mut cfg = AppConfig::default();
    cfg.tier1.suspicious_path_substrings = vec!["wp-admin".to_string()];
    cfg.tier2.enabled = false;
    cfg.alert_throttle_duration_seconds = 10;
    cfg.alert_throttle_max_alerts = 100;
    let (mut engine, mut rules, manager, _registry) = pipeline(cfg);

    for second in [0u64, 2] {
        let record = vigil_core::model::LogRecord::parse(
            &log_line("6.6.6.6", second, "/wp-admin/x", 404, "ua"),
            second + 1,
        )
        .unwrap();
        let event = engine.process(record).unwrap();
        for alert in rules.evaluate(&event) {
            manager.record_alert(alert);
        }
    }

    assert_eq!(manager.alerts_processed(), 2);
    assert_eq!(manager.alerts_throttled(), 1, "2 s apart within 10 s window");
    assert_eq!(manager.queue_len(), 1);
}

#[test]
fn bytes_spike_triggers_tier2_end_to_end() {
    let mut cfg = AppConfig::default();
    cfg.tier1.enabled = false;
    let (mut engine, mut rules, _manager, _registry) = pipeline(cfg);

    // Warm-up: 30 requests around 1000 bytes.
    for i in 0..30u64 {
        let mut line = log_line("9.9.9.9", i % 60, "/dl", 200, "ua");
        line = line.replace(" 512 ", &format!(" {} ", 995 + (i % 3) * 10));
        let mut record = vigil_core::model::LogRecord::parse(&line, i + 1).unwrap();
        record.timestamp_ms += i; // keep inserts ordered
        let event = engine.process(record).unwrap();
        assert!(rules.evaluate(&event).is_empty(), "warm-up must stay quiet");
    }

    // The spike.
    let line = log_line("9.9.9.9", 59, "/dl", 200, "ua").replace(" 512 ", " 1000000 ");
    let record = vigil_core::model::LogRecord::parse(&line, 31).unwrap();
    let event = engine.process(record).unwrap();
    let alerts = rules.evaluate(&event);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].tier, AlertTier::Tier2Statistical);
    assert!(alerts[0].reason.contains("bytes sent"));
}
