//! Alert manager: deduplication, throttling, queueing and dispatch
//! fan-out.

pub mod dispatch;

pub use dispatch::{Dispatcher, build_dispatchers};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use crate::metrics::{Counter, Gauge, Histogram, MetricsRegistry, RegistryError};
use crate::model::Alert;
use crate::util::AlertQueue;

/// Recent alerts retained for the operational API.
const RECENT_ALERTS_CAP: usize = 50;

/// Metric handles owned by the manager.
struct Metrics {
    alerts_total: Arc<Counter>,
    alerts_throttled_total: Arc<Counter>,
    alerts_suppressed_total: Arc<Counter>,
    throttling_ratio: Arc<Gauge>,
    recent_alerts_count: Arc<Gauge>,
    queue_size: Arc<Gauge>,
    dispatch_attempts_total: Arc<Counter>,
    dispatch_success_total: Arc<Counter>,
    dispatch_failure_total: Arc<Counter>,
    dispatch_duration_seconds: Arc<Histogram>,
}

impl Metrics {
    fn register(registry: &MetricsRegistry) -> Result<Self, RegistryError> {
        Ok(Self {
            alerts_total: registry.register_counter(
                "ad_alerts_total",
                "Alerts recorded, by tier and suggested action.",
                &["tier", "action"],
            )?,
            alerts_throttled_total: registry.register_counter(
                "ad_alerts_throttled_total",
                "Alerts suppressed by throttling, by reason.",
                &["reason"],
            )?,
            alerts_suppressed_total: registry.register_counter(
                "ad_alerts_suppressed_total",
                "Alerts suppressed by throttling, by reason and tier.",
                &["reason", "tier"],
            )?,
            throttling_ratio: registry.register_gauge(
                "ad_alert_throttling_ratio",
                "Throttled / processed alerts.",
                &[],
            )?,
            recent_alerts_count: registry.register_gauge(
                "ad_recent_alerts_count",
                "Alerts currently held in the recent ring.",
                &[],
            )?,
            queue_size: registry.register_gauge(
                "ad_alert_queue_size",
                "Alerts waiting for dispatch.",
                &[],
            )?,
            dispatch_attempts_total: registry.register_counter(
                "ad_alert_dispatch_attempts_total",
                "Dispatch attempts, by dispatcher type.",
                &["dispatcher_type"],
            )?,
            dispatch_success_total: registry.register_counter(
                "ad_alert_dispatch_success_total",
                "Successful dispatches, by dispatcher type.",
                &["dispatcher_type"],
            )?,
            dispatch_failure_total: registry.register_counter(
                "ad_alert_dispatch_failure_total",
                "Failed dispatches, by dispatcher type.",
                &["dispatcher_type"],
            )?,
            dispatch_duration_seconds: registry.register_histogram(
                "ad_alert_dispatch_duration_seconds",
                "Dispatch call latency, by dispatcher type.",
                &["dispatcher_type"],
            )?,
        })
    }
}

struct Shared {
    queue: AlertQueue<Alert>,
    /// Throttle key -> (last emission timestamp, its global sequence).
    throttle: Mutex<HashMap<String, (u64, u64)>>,
    /// Newest-first ring of recently emitted alerts.
    recent: Mutex<VecDeque<Alert>>,
    total_recorded: AtomicU64,
    alerts_processed: AtomicU64,
    alerts_throttled: AtomicU64,
    throttle_duration_ms: u64,
    max_intervening_alerts: u64,
    alerts_to_stdout: bool,
    metrics: Metrics,
}

pub struct AlertManager {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AlertManager {
    pub fn new(
        registry: &MetricsRegistry,
        throttle_duration_ms: u64,
        max_intervening_alerts: u64,
        alerts_to_stdout: bool,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            shared: Arc::new(Shared {
                queue: AlertQueue::unbounded(),
                throttle: Mutex::new(HashMap::new()),
                recent: Mutex::new(VecDeque::with_capacity(RECENT_ALERTS_CAP)),
                total_recorded: AtomicU64::new(0),
                alerts_processed: AtomicU64::new(0),
                alerts_throttled: AtomicU64::new(0),
                throttle_duration_ms,
                max_intervening_alerts,
                alerts_to_stdout,
                metrics: Metrics::register(registry)?,
            }),
            consumer: Mutex::new(None),
        })
    }

    /// Start the consumer thread fanning alerts out to `dispatchers`.
    pub fn start(&self, mut dispatchers: Vec<Box<dyn Dispatcher>>) {
        let shared = Arc::clone(&self.shared);
        info!(
            "alert manager started with {} dispatcher(s)",
            dispatchers.len()
        );
        let handle = std::thread::Builder::new()
            .name("vigil-dispatch".to_string())
            .spawn(move || {
                while let Some(alert) = shared.queue.wait_and_pop() {
                    shared
                        .metrics
                        .queue_size
                        .set(shared.queue.len() as f64);
                    if shared.alerts_to_stdout {
                        println!("{}", format_human(&alert));
                    }
                    for dispatcher in dispatchers.iter_mut() {
                        let kind = dispatcher.kind();
                        shared.metrics.dispatch_attempts_total.inc(&[kind]);
                        let started = Instant::now();
                        let ok = dispatcher.dispatch(&alert);
                        let elapsed = started.elapsed().as_secs_f64();
                        shared
                            .metrics
                            .dispatch_duration_seconds
                            .observe(&[kind], elapsed);
                        if ok {
                            shared.metrics.dispatch_success_total.inc(&[kind]);
                        } else {
                            shared.metrics.dispatch_failure_total.inc(&[kind]);
                        }
                    }
                }
                debug!("alert dispatch thread exiting");
            })
            .expect("spawn alert dispatch thread");
        *self.consumer.lock().unwrap() = Some(handle);
    }

    /// Record one alert: throttle, remember, enqueue.
    pub fn record_alert(&self, alert: Alert) {
        let shared = &self.shared;
        shared.alerts_processed.fetch_add(1, Ordering::Relaxed);

        if shared.throttle_duration_ms > 0 {
            let key = alert.throttle_key();
            let mut throttle = shared.throttle.lock().unwrap();

            if let Some(&(last_ts, last_seq)) = throttle.get(&key) {
                let total = shared.total_recorded.load(Ordering::Relaxed);
                let intervening = total - last_seq;
                let in_time_window =
                    alert.timestamp_ms < last_ts + shared.throttle_duration_ms;
                let exceeded_intervening = shared.max_intervening_alerts > 0
                    && intervening >= shared.max_intervening_alerts;

                if in_time_window && !exceeded_intervening {
                    drop(throttle);
                    shared.alerts_throttled.fetch_add(1, Ordering::Relaxed);
                    let reason = if in_time_window {
                        "time_window"
                    } else {
                        "intervening_limit"
                    };
                    shared.metrics.alerts_throttled_total.inc(&[reason]);
                    shared
                        .metrics
                        .alerts_suppressed_total
                        .inc(&[reason, alert.tier.label()]);
                    let processed = shared.alerts_processed.load(Ordering::Relaxed);
                    let throttled = shared.alerts_throttled.load(Ordering::Relaxed);
                    shared
                        .metrics
                        .throttling_ratio
                        .set(throttled as f64 / processed as f64);
                    return;
                }
            }

            let sequence = shared.total_recorded.fetch_add(1, Ordering::Relaxed) + 1;
            throttle.insert(key, (alert.timestamp_ms, sequence));
        } else {
            shared.total_recorded.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut recent = shared.recent.lock().unwrap();
            recent.push_front(alert.clone());
            if recent.len() > RECENT_ALERTS_CAP {
                recent.pop_back();
            }
            shared
                .metrics
                .recent_alerts_count
                .set(recent.len() as f64);
        }

        shared
            .metrics
            .alerts_total
            .inc(&[alert.tier.label(), alert.action.label()]);

        shared.queue.push(alert);
        shared.metrics.queue_size.set(shared.queue.len() as f64);
    }

    /// Newest-first snapshot of the recent-alert ring.
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let recent = self.shared.recent.lock().unwrap();
        recent.iter().take(limit).cloned().collect()
    }

    pub fn alerts_processed(&self) -> u64 {
        self.shared.alerts_processed.load(Ordering::Relaxed)
    }

    pub fn alerts_throttled(&self) -> u64 {
        self.shared.alerts_throttled.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Close the queue and join the consumer once it has drained.
    pub fn shutdown(&self) {
        self.shared.queue.shutdown();
        if let Some(handle) = self.consumer.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AlertManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Human-readable block for stdout, one alert per block.
fn format_human(alert: &Alert) -> String {
    let ts = Utc
        .timestamp_millis_opt(alert.timestamp_ms as i64)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| alert.timestamp_ms.to_string());

    let mut out = String::from("ALERT DETECTED:\n");
    out.push_str(&format!("  Timestamp: {ts}\n"));
    out.push_str(&format!("  Tier:      {}\n", alert.tier.as_str()));
    out.push_str(&format!("  Source IP: {}\n", alert.source_ip));
    out.push_str(&format!("  Reason:    {}\n", alert.reason));
    if alert.offending_key != alert.source_ip {
        out.push_str(&format!("  Key ID:    {}\n", alert.offending_key));
    }
    out.push_str(&format!("  Score:     {:.3}\n", alert.score));
    out.push_str(&format!("  Action:    {}\n", alert.action.as_str()));
    if let Some(note) = &alert.feature_note {
        out.push_str(&format!("  Factors:   {note}\n"));
    }
    if alert.log_line > 0 {
        out.push_str(&format!("  Log Line:  {}\n", alert.log_line));
    }
    if !alert.raw_sample.is_empty() {
        let sample: String = alert.raw_sample.chars().take(100).collect();
        out.push_str(&format!("  Sample:    {sample}\n"));
    }
    out.push_str("----------------------------------------");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertAction, AlertTier, AnalyzedEvent, LogRecord};
    use std::sync::atomic::AtomicUsize;

    fn alert_at(ts_ms: u64, ip: &str, reason: &str) -> Alert {
        let line = format!(
            "{ip} - - [01/Jan/2026:00:00:00 +0000] \"GET / HTTP/1.1\" 200 1 \"-\" \"ua\""
        );
        let mut record = LogRecord::parse(&line, 1).unwrap();
        record.timestamp_ms = ts_ms;
        let event = Arc::new(AnalyzedEvent::new(Arc::new(record)));
        Alert::new(event, reason, AlertTier::Tier1Heuristic, AlertAction::Log, 0.5)
    }

    fn manager(throttle_s: u64, max_intervening: u64) -> (AlertManager, Arc<MetricsRegistry>) {
        let registry = Arc::new(MetricsRegistry::new());
        let manager = AlertManager::new(&registry, throttle_s * 1000, max_intervening, false).unwrap();
        (manager, registry)
    }

    #[test]
    fn test_identical_alert_throttled_in_window() {
        // Two identical alerts 2 s apart with a 10 s window: the
        // second is suppressed with reason time_window.
        let (manager, _registry) = manager(10, 100);
        manager.record_alert(alert_at(1_000, "1.2.3.4", "High request rate"));
        manager.record_alert(alert_at(3_000, "1.2.3.4", "High request rate"));

        assert_eq!(manager.alerts_processed(), 2);
        assert_eq!(manager.alerts_throttled(), 1);
        assert_eq!(manager.queue_len(), 1);
        assert_eq!(
            manager
                .shared
                .metrics
                .alerts_throttled_total
                .value(&["time_window"]),
            1
        );
    }

    #[test]
    fn test_different_key_not_throttled() {
        let (manager, _) = manager(10, 100);
        manager.record_alert(alert_at(1_000, "1.2.3.4", "High request rate"));
        manager.record_alert(alert_at(1_500, "5.6.7.8", "High request rate"));
        manager.record_alert(alert_at(2_000, "1.2.3.4", "Suspicious path"));
        assert_eq!(manager.alerts_throttled(), 0);
        assert_eq!(manager.queue_len(), 3);
    }

    #[test]
    fn test_emits_again_outside_window() {
        let (manager, _) = manager(10, 100);
        manager.record_alert(alert_at(1_000, "1.2.3.4", "r"));
        manager.record_alert(alert_at(12_000, "1.2.3.4", "r"));
        assert_eq!(manager.alerts_throttled(), 0);
        assert_eq!(manager.queue_len(), 2);
    }

    #[test]
    fn test_intervening_limit_allows_reemit() {
        // With a small intervening budget, enough other alerts between
        // duplicates re-arms the key even inside the time window.
        let (manager, _) = manager(3600, 3);
        manager.record_alert(alert_at(1_000, "1.2.3.4", "r"));
        for i in 0..3u64 {
            manager.record_alert(alert_at(2_000 + i, "9.9.9.9", &format!("other-{i}")));
        }
        manager.record_alert(alert_at(10_000, "1.2.3.4", "r"));
        assert_eq!(manager.alerts_throttled(), 0, "intervening limit exceeded");
        assert_eq!(manager.queue_len(), 5);
    }

    #[test]
    fn test_throttling_invariant() {
        // Every suppressed alert has an earlier emitted alert with the
        // same key inside the window and sequence gap.
        let (manager, _) = manager(10, 100);
        manager.record_alert(alert_at(1_000, "1.2.3.4", "r"));
        manager.record_alert(alert_at(5_000, "1.2.3.4", "r"));
        let throttle = manager.shared.throttle.lock().unwrap();
        let &(last_ts, last_seq) = throttle.get("1.2.3.4:r").unwrap();
        assert_eq!(last_ts, 1_000, "suppression did not move the anchor");
        assert!(5_000 - last_ts < 10_000);
        let total = manager.shared.total_recorded.load(Ordering::Relaxed);
        assert!(total - last_seq < 100);
    }

    #[test]
    fn test_recent_ring_bounded_newest_first() {
        let (manager, _) = manager(0, 0);
        for i in 0..60u64 {
            manager.record_alert(alert_at(i * 1_000, "1.2.3.4", &format!("reason-{i}")));
        }
        let recent = manager.recent_alerts(100);
        assert_eq!(recent.len(), RECENT_ALERTS_CAP);
        assert_eq!(recent[0].reason, "reason-59");
        assert_eq!(recent.last().unwrap().reason, "reason-10");
    }

    #[test]
    fn test_tier_action_counters() {
        let (manager, _) = manager(0, 0);
        manager.record_alert(alert_at(1_000, "1.2.3.4", "a"));
        assert_eq!(
            manager.shared.metrics.alerts_total.value(&["tier1", "log"]),
            1
        );
    }

    struct CountingDispatcher {
        calls: Arc<AtomicUsize>,
        succeed: bool,
    }

    impl Dispatcher for CountingDispatcher {
        fn kind(&self) -> &'static str {
            "counting"
        }
        fn dispatch(&mut self, _alert: &Alert) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.succeed
        }
    }

    #[test]
    fn test_consumer_fans_out_and_failures_do_not_stop_others() {
        let (manager, _) = manager(0, 0);
        let failing_calls = Arc::new(AtomicUsize::new(0));
        let ok_calls = Arc::new(AtomicUsize::new(0));
        manager.start(vec![
            Box::new(CountingDispatcher {
                calls: Arc::clone(&failing_calls),
                succeed: false,
            }),
            Box::new(CountingDispatcher {
                calls: Arc::clone(&ok_calls),
                succeed: true,
            }),
        ]);

        for i in 0..5u64 {
            manager.record_alert(alert_at(i * 1_000, "1.2.3.4", &format!("r{i}")));
        }
        manager.shutdown();

        assert_eq!(failing_calls.load(Ordering::SeqCst), 5);
        assert_eq!(ok_calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            manager
                .shared
                .metrics
                .dispatch_failure_total
                .value(&["counting"]),
            5
        );
        assert_eq!(
            manager
                .shared
                .metrics
                .dispatch_attempts_total
                .value(&["counting"]),
            10
        );
    }
}
