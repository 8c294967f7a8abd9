//! vigil-core — shared library for the vigil anomaly detector.
//!
//! Provides:
//! - `source` — access-log ingestion (file tail, database cursor)
//! - `analysis` — per-event enrichment over bounded per-IP/path/session state
//! - `rules` — the four-tier detection cascade
//! - `alerts` — throttling, queueing and dispatch fan-out
//! - `state` — the concurrent state store with hibernation and eviction
//! - `memory` — global memory-pressure tracking
//! - `metrics` — the counter/gauge/histogram registry
//! - `api` — JSON view types for the operational HTTP surface
//! - `util` — windows, stats, bloom filters, interner, queue

pub mod alerts;
pub mod analysis;
pub mod api;
pub mod config;
pub mod memory;
pub mod metrics;
pub mod ml;
pub mod model;
pub mod rules;
pub mod source;
pub mod state;
pub mod util;

/// Crate version, surfaced by the binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
