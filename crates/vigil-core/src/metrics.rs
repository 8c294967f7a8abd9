//! Process-wide metrics registry exposed over the operational HTTP
//! surface.
//!
//! Three metric kinds, each with a name, help text and a fixed label
//! set. Registration hands back an `Arc` handle that components keep;
//! scrapes snapshot series under brief per-metric locks so writers are
//! never blocked for long.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

/// Histogram observations kept for quantile estimation. Older samples
/// are discarded ring-style; `_sum`/`_count` still cover everything
/// ever observed.
const HISTOGRAM_RING_CAP: usize = 10_000;

/// Quantiles computed on scrape from a sorted copy of the current
/// observations.
const QUANTILES: [f64; 3] = [0.5, 0.9, 0.99];

#[derive(Debug)]
pub struct RegistryError(pub String);

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RegistryError {}

/// Monotonic counter with one value per label tuple.
pub struct Counter {
    name: String,
    help: String,
    label_names: Vec<&'static str>,
    series: Mutex<HashMap<Vec<String>, u64>>,
}

impl Counter {
    /// Atomically add `by` to the series identified by `labels`.
    /// Label count must match the registered label names.
    pub fn increment(&self, labels: &[&str], by: u64) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let mut series = self.series.lock().unwrap();
        *series.entry(key).or_insert(0) += by;
    }

    pub fn inc(&self, labels: &[&str]) {
        self.increment(labels, 1);
    }

    /// Current value for a label tuple (0 when never incremented).
    pub fn value(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.series.lock().unwrap().get(&key).copied().unwrap_or(0)
    }

    /// Sum across all label tuples.
    pub fn total(&self) -> u64 {
        self.series.lock().unwrap().values().sum()
    }
}

/// Gauge with an unlabeled fast path (`set`) and labeled series.
pub struct Gauge {
    name: String,
    help: String,
    label_names: Vec<&'static str>,
    // Unlabeled value stored as f64 bits for lock-free set.
    scalar: AtomicU64,
    series: Mutex<HashMap<Vec<String>, f64>>,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.scalar.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn set_labeled(&self, labels: &[&str], value: f64) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.series.lock().unwrap().insert(key, value);
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.scalar.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct HistogramSeries {
    observations: Vec<f64>,
    next: usize,
    sum: f64,
    count: u64,
}

impl HistogramSeries {
    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        if self.observations.len() < HISTOGRAM_RING_CAP {
            self.observations.push(value);
        } else {
            self.observations[self.next] = value;
            self.next = (self.next + 1) % HISTOGRAM_RING_CAP;
        }
    }

    fn quantiles(&self) -> Vec<(f64, f64)> {
        let mut sorted = self.observations.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        QUANTILES
            .iter()
            .map(|&q| {
                let value = if sorted.is_empty() {
                    0.0
                } else {
                    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
                    sorted[idx]
                };
                (q, value)
            })
            .collect()
    }
}

/// Histogram that keeps a bounded ring of raw observations per label
/// tuple and derives quantiles from a sorted copy on scrape. Accurate
/// enough at scrape cadence; no pre-bucketed structure.
pub struct Histogram {
    name: String,
    help: String,
    label_names: Vec<&'static str>,
    series: Mutex<HashMap<Vec<String>, HistogramSeries>>,
}

impl Histogram {
    pub fn observe(&self, labels: &[&str], value: f64) {
        debug_assert_eq!(labels.len(), self.label_names.len());
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.series
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .observe(value);
    }

    pub fn count(&self) -> u64 {
        self.series.lock().unwrap().values().map(|s| s.count).sum()
    }

    /// `(labels, sum, count, quantiles)` per series.
    #[allow(clippy::type_complexity)]
    fn snapshot(&self) -> Vec<(Vec<String>, f64, u64, Vec<(f64, f64)>)> {
        let series = self.series.lock().unwrap();
        let mut rows: Vec<_> = series
            .iter()
            .map(|(labels, s)| (labels.clone(), s.sum, s.count, s.quantiles()))
            .collect();
        drop(series);
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

/// The registry. Duplicate names are rejected across all three kinds.
pub struct MetricsRegistry {
    counters: Mutex<Vec<Arc<Counter>>>,
    gauges: Mutex<Vec<Arc<Gauge>>>,
    histograms: Mutex<Vec<Arc<Histogram>>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Vec::new()),
            gauges: Mutex::new(Vec::new()),
            histograms: Mutex::new(Vec::new()),
        }
    }

    fn name_taken(&self, name: &str) -> bool {
        self.counters.lock().unwrap().iter().any(|c| c.name == name)
            || self.gauges.lock().unwrap().iter().any(|g| g.name == name)
            || self
                .histograms
                .lock()
                .unwrap()
                .iter()
                .any(|h| h.name == name)
    }

    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&'static str],
    ) -> Result<Arc<Counter>, RegistryError> {
        if self.name_taken(name) {
            return Err(RegistryError(format!("metric already registered: {name}")));
        }
        let counter = Arc::new(Counter {
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.to_vec(),
            series: Mutex::new(HashMap::new()),
        });
        self.counters.lock().unwrap().push(Arc::clone(&counter));
        Ok(counter)
    }

    pub fn register_gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&'static str],
    ) -> Result<Arc<Gauge>, RegistryError> {
        if self.name_taken(name) {
            return Err(RegistryError(format!("metric already registered: {name}")));
        }
        let gauge = Arc::new(Gauge {
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.to_vec(),
            scalar: AtomicU64::new(0f64.to_bits()),
            series: Mutex::new(HashMap::new()),
        });
        self.gauges.lock().unwrap().push(Arc::clone(&gauge));
        Ok(gauge)
    }

    pub fn register_histogram(
        &self,
        name: &str,
        help: &str,
        label_names: &[&'static str],
    ) -> Result<Arc<Histogram>, RegistryError> {
        if self.name_taken(name) {
            return Err(RegistryError(format!("metric already registered: {name}")));
        }
        let histogram = Arc::new(Histogram {
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.to_vec(),
            series: Mutex::new(HashMap::new()),
        });
        self.histograms.lock().unwrap().push(Arc::clone(&histogram));
        Ok(histogram)
    }

    /// Render the Prometheus text exposition format.
    pub fn render_text(&self) -> String {
        let mut out = String::with_capacity(4096);

        for counter in self.counters.lock().unwrap().iter() {
            let _ = writeln!(out, "# HELP {} {}", counter.name, counter.help);
            let _ = writeln!(out, "# TYPE {} counter", counter.name);
            let series = counter.series.lock().unwrap();
            if series.is_empty() {
                let _ = writeln!(out, "{} 0", counter.name);
                continue;
            }
            let mut rows: Vec<(&Vec<String>, &u64)> = series.iter().collect();
            rows.sort_by(|a, b| a.0.cmp(b.0));
            for (labels, value) in rows {
                if labels.is_empty() {
                    let _ = writeln!(out, "{} {}", counter.name, value);
                } else {
                    let rendered = render_labels(&counter.label_names, labels);
                    let _ = writeln!(out, "{}{{{}}} {}", counter.name, rendered, value);
                }
            }
        }

        for gauge in self.gauges.lock().unwrap().iter() {
            let _ = writeln!(out, "# HELP {} {}", gauge.name, gauge.help);
            let _ = writeln!(out, "# TYPE {} gauge", gauge.name);
            let series = gauge.series.lock().unwrap();
            if gauge.label_names.is_empty() || series.is_empty() {
                let _ = writeln!(out, "{} {}", gauge.name, gauge.value());
            }
            let mut rows: Vec<(&Vec<String>, &f64)> = series.iter().collect();
            rows.sort_by(|a, b| a.0.cmp(b.0));
            for (labels, value) in rows {
                let rendered = render_labels(&gauge.label_names, labels);
                let _ = writeln!(out, "{}{{{}}} {}", gauge.name, rendered, value);
            }
        }

        for histogram in self.histograms.lock().unwrap().iter() {
            let _ = writeln!(out, "# HELP {} {}", histogram.name, histogram.help);
            let _ = writeln!(out, "# TYPE {} summary", histogram.name);
            for (labels, sum, count, quantiles) in histogram.snapshot() {
                let rendered = render_labels(&histogram.label_names, &labels);
                for (q, value) in quantiles {
                    if rendered.is_empty() {
                        let _ =
                            writeln!(out, "{}{{quantile=\"{}\"}} {}", histogram.name, q, value);
                    } else {
                        let _ = writeln!(
                            out,
                            "{}{{{},quantile=\"{}\"}} {}",
                            histogram.name, rendered, q, value
                        );
                    }
                }
                if rendered.is_empty() {
                    let _ = writeln!(out, "{}_sum {}", histogram.name, sum);
                    let _ = writeln!(out, "{}_count {}", histogram.name, count);
                } else {
                    let _ = writeln!(out, "{}_sum{{{}}} {}", histogram.name, rendered, sum);
                    let _ = writeln!(out, "{}_count{{{}}} {}", histogram.name, rendered, count);
                }
            }
        }

        out
    }

    /// JSON snapshot for the performance endpoint.
    pub fn snapshot_json(&self) -> Value {
        let mut counters = serde_json::Map::new();
        for counter in self.counters.lock().unwrap().iter() {
            let series = counter.series.lock().unwrap();
            let mut by_labels = serde_json::Map::new();
            for (labels, value) in series.iter() {
                let key = if labels.is_empty() {
                    "total".to_string()
                } else {
                    counter
                        .label_names
                        .iter()
                        .zip(labels)
                        .map(|(n, v)| format!("{n}={v}"))
                        .collect::<Vec<_>>()
                        .join(",")
                };
                by_labels.insert(key, json!(value));
            }
            counters.insert(counter.name.clone(), Value::Object(by_labels));
        }

        let mut gauges = serde_json::Map::new();
        for gauge in self.gauges.lock().unwrap().iter() {
            gauges.insert(gauge.name.clone(), json!(gauge.value()));
        }

        let mut histograms = serde_json::Map::new();
        for histogram in self.histograms.lock().unwrap().iter() {
            let mut by_labels = serde_json::Map::new();
            for (labels, sum, count, quantiles) in histogram.snapshot() {
                let key = if labels.is_empty() {
                    "total".to_string()
                } else {
                    histogram
                        .label_names
                        .iter()
                        .zip(&labels)
                        .map(|(n, v)| format!("{n}={v}"))
                        .collect::<Vec<_>>()
                        .join(",")
                };
                let q: serde_json::Map<String, Value> = quantiles
                    .into_iter()
                    .map(|(q, v)| (format!("p{}", (q * 100.0) as u32), json!(v)))
                    .collect();
                by_labels.insert(key, json!({ "sum": sum, "count": count, "quantiles": q }));
            }
            histograms.insert(histogram.name.clone(), Value::Object(by_labels));
        }

        json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

fn render_labels(names: &[&'static str], values: &[String]) -> String {
    names
        .iter()
        .zip(values)
        .map(|(n, v)| format!("{n}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",")
}
