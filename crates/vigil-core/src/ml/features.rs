//! Feature extraction and normalization for ML inference.
//!
//! The feature vector has a fixed order and width
//! ([`FEATURE_VECTOR_SIZE`]). Each slot is normalized by a learned
//! per-feature mean and standard deviation loaded from the model's
//! JSON metadata sidecar, then squashed with `tanh`. Repeated
//! inferences on identical vectors are short-circuited by a small
//! cache of 8-bit quantized vectors with a short TTL.

use crate::model::AnalyzedEvent;

use serde::Deserialize;

/// Fixed feature-vector width. Shorter extractions pad with zeros;
/// anything longer is truncated.
pub const FEATURE_VECTOR_SIZE: usize = 32;

/// Cache slots for quantized vectors.
const FEATURE_CACHE_SIZE: usize = 512;

/// Per-feature normalization parameters from the sidecar.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct NormalizationParams {
    pub mean: f64,
    #[serde(rename = "std")]
    pub std_dev: f64,
}

impl Default for NormalizationParams {
    fn default() -> Self {
        Self {
            mean: 0.0,
            std_dev: 1.0,
        }
    }
}

#[derive(Clone, Copy)]
struct CacheEntry {
    event_hash: u64,
    stored_at_ms: u64,
    quantized: [i8; FEATURE_VECTOR_SIZE],
}

/// Extracts, normalizes and caches feature vectors.
pub struct FeatureManager {
    normalization: [NormalizationParams; FEATURE_VECTOR_SIZE],
    cache: Vec<Option<CacheEntry>>,
    cache_ttl_ms: u64,
    cache_hits: u64,
    cache_misses: u64,
}

impl FeatureManager {
    pub fn new(cache_ttl_ms: u64) -> Self {
        Self {
            normalization: [NormalizationParams::default(); FEATURE_VECTOR_SIZE],
            cache: vec![None; FEATURE_CACHE_SIZE],
            cache_ttl_ms,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    /// Install normalization parameters (index-aligned with the
    /// feature order; missing tail slots keep identity scaling).
    pub fn set_normalization(&mut self, params: &[NormalizationParams]) {
        for (slot, p) in self.normalization.iter_mut().zip(params) {
            *slot = *p;
        }
        self.clear_cache();
    }

    /// Drop all cached vectors (called on model swap).
    pub fn clear_cache(&mut self) {
        self.cache.iter_mut().for_each(|slot| *slot = None);
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        (self.cache_hits, self.cache_misses)
    }

    /// Extract the raw (unnormalized) ordered features.
    pub fn extract_raw(event: &AnalyzedEvent) -> Vec<f64> {
        let record = &event.record;
        let session = event.session.unwrap_or_default();
        let mut features = vec![
            event.requests_in_window as f64,
            event.failed_logins_in_window as f64,
            event.html_requests_in_window as f64,
            event.asset_requests_in_window as f64,
            event.ip_z.request_time.unwrap_or(0.0),
            event.ip_z.bytes_sent.unwrap_or(0.0),
            event.ip_z.error_rate.unwrap_or(0.0),
            event.ip_z.request_volume.unwrap_or(0.0),
            event.path_z.request_time.unwrap_or(0.0),
            event.path_z.bytes_sent.unwrap_or(0.0),
            event.path_z.error_rate.unwrap_or(0.0),
            event.path_z.request_volume.unwrap_or(0.0),
            record.bytes_sent as f64,
            record.request_time_s.unwrap_or(0.0),
            record.status as f64 / 100.0,
            bool_f(record.is_error()),
            bool_f(event.is_new_ip),
            bool_f(event.is_path_new_for_ip),
            bool_f(event.ua.missing),
            bool_f(event.ua.known_bad),
            bool_f(event.ua.headless),
            bool_f(event.ua.outdated_browser),
            bool_f(event.ua.cycling),
            bool_f(event.suspicious_path_found),
            bool_f(event.suspicious_ua_found),
            bool_f(event.sensitive_path_found),
            session.request_count as f64,
            session.failed_logins as f64,
            session.client_errors as f64 + session.server_errors as f64,
            session.unique_user_agents as f64,
            session.mean_request_interval_ms / 1000.0,
            (record.timestamp_ms / 3_600_000 % 24) as f64,
        ];
        features.truncate(FEATURE_VECTOR_SIZE);
        features.resize(FEATURE_VECTOR_SIZE, 0.0);
        features
    }

    /// Normalized, `tanh`-squashed feature vector for the event.
    /// A cached quantized copy is returned when the same vector was
    /// seen within the TTL.
    pub fn features_for(&mut self, event: &AnalyzedEvent, now_ms: u64) -> Vec<f32> {
        let raw = Self::extract_raw(event);
        let event_hash = cheap_hash(&raw);
        let slot = (event_hash as usize) % FEATURE_CACHE_SIZE;

        if let Some(entry) = &self.cache[slot]
            && entry.event_hash == event_hash
            && now_ms.saturating_sub(entry.stored_at_ms) < self.cache_ttl_ms
        {
            self.cache_hits += 1;
            return entry.quantized.iter().map(|&q| dequantize(q)).collect();
        }
        self.cache_misses += 1;

        let normalized: Vec<f32> = raw
            .iter()
            .enumerate()
            .map(|(i, &value)| {
                let p = &self.normalization[i];
                let sd = if p.std_dev.abs() <= f64::EPSILON {
                    1.0
                } else {
                    p.std_dev
                };
                ((value - p.mean) / sd).tanh() as f32
            })
            .collect();

        let mut quantized = [0i8; FEATURE_VECTOR_SIZE];
        for (q, &v) in quantized.iter_mut().zip(&normalized) {
            *q = quantize(v);
        }
        self.cache[slot] = Some(CacheEntry {
            event_hash,
            stored_at_ms: now_ms,
            quantized,
        });

        normalized
    }
}

fn bool_f(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

/// Values are already squashed to [-1, 1]; map onto [-127, 127].
fn quantize(v: f32) -> i8 {
    (v.clamp(-1.0, 1.0) * 127.0).round() as i8
}

fn dequantize(q: i8) -> f32 {
    q as f32 / 127.0
}

/// Cheap FNV-style hash over feature bits for cache keying.
fn cheap_hash(features: &[f64]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &f in features {
        hash ^= f.to_bits();
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnalyzedEvent, LogRecord};
    use std::sync::Arc;

    fn event() -> AnalyzedEvent {
        let line = "1.2.3.4 - - [01/Jan/2026:00:00:00 +0000] \"GET /x HTTP/1.1\" 200 512 \"-\" \"ua\"";
        let record = Arc::new(LogRecord::parse(line, 1).unwrap());
        let mut e = AnalyzedEvent::new(record);
        e.requests_in_window = 10;
        e.ip_z.bytes_sent = Some(2.5);
        e
    }

    #[test]
    fn test_vector_width_fixed() {
        let raw = FeatureManager::extract_raw(&event());
        assert_eq!(raw.len(), FEATURE_VECTOR_SIZE);
    }

    #[test]
    fn test_normalization_and_squash() {
        let mut fm = FeatureManager::new(30_000);
        let mut params = [NormalizationParams::default(); FEATURE_VECTOR_SIZE];
        params[0] = NormalizationParams {
            mean: 5.0,
            std_dev: 5.0,
        };
        fm.set_normalization(&params);

        let features = fm.features_for(&event(), 0);
        assert_eq!(features.len(), FEATURE_VECTOR_SIZE);
        // Slot 0: requests_in_window = 10 → (10-5)/5 = 1 → tanh(1).
        assert!((features[0] - 1f32.tanh()).abs() < 1e-6);
        // Everything stays inside (-1, 1).
        assert!(features.iter().all(|f| f.abs() <= 1.0));
    }

    #[test]
    fn test_cache_hits_within_ttl() {
        let mut fm = FeatureManager::new(30_000);
        let e = event();
        let first = fm.features_for(&e, 1_000);
        let second = fm.features_for(&e, 2_000);
        assert_eq!(fm.cache_stats(), (1, 1));
        // Quantized round-trip stays within 8-bit tolerance.
        for (a, b) in first.iter().zip(&second) {
            assert!((a - b).abs() <= 1.0 / 127.0 + 1e-6);
        }
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let mut fm = FeatureManager::new(30_000);
        let e = event();
        fm.features_for(&e, 1_000);
        fm.features_for(&e, 40_000);
        assert_eq!(fm.cache_stats(), (0, 2));
    }

    #[test]
    fn test_clear_cache() {
        let mut fm = FeatureManager::new(30_000);
        let e = event();
        fm.features_for(&e, 1_000);
        fm.clear_cache();
        fm.features_for(&e, 1_001);
        assert_eq!(fm.cache_stats(), (0, 2));
    }
}
