//! vigil-dump - offline inspection of vigil artifacts.
//!
//! Decodes engine state snapshot files and pretty-prints alert NDJSON
//! files without a running daemon.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};

use vigil_core::config::Tier1Config;
use vigil_core::state::snapshot;

#[derive(Parser)]
#[command(name = "vigil-dump", about = "Inspect vigil state and alert files", version = vigil_core::VERSION)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a state snapshot file and print its per-IP entries.
    State {
        /// Path to the snapshot file.
        path: PathBuf,
        /// Print at most this many entries (0 = all).
        #[arg(long, default_value = "0")]
        limit: usize,
    },
    /// Pretty-print an alert NDJSON file.
    Alerts {
        /// Path to the NDJSON file.
        path: PathBuf,
        /// Only show alerts at or above this score.
        #[arg(long, default_value = "0.0")]
        min_score: f64,
    },
}

fn format_ts(ms: u64) -> String {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn dump_state(path: &PathBuf, limit: usize) -> Result<(), String> {
    let entries = snapshot::load(path, &Tier1Config::default())
        .map_err(|e| format!("cannot decode {}: {e}", path.display()))?;

    println!("{}: {} per-IP entries", path.display(), entries.len());
    println!(
        "{:<16} {:>20} {:>20} {:>8} {:>8} {:>10}",
        "IP", "FIRST SEEN", "LAST SEEN", "REQS", "ERRORS", "FLAGS"
    );
    let shown = if limit == 0 { entries.len() } else { limit };
    for (key, state) in entries.iter().take(shown) {
        println!(
            "{:<16} {:>20} {:>20} {:>8} {:>8} {:>#10x}",
            Ipv4Addr::from(*key as u32).to_string(),
            format_ts(state.first_seen_ms),
            format_ts(state.last_seen_ms),
            state.request_volume.count(),
            state.error_rate.sum().round() as u64,
            state.threat_flags,
        );
    }
    if shown < entries.len() {
        println!("... {} more", entries.len() - shown);
    }
    Ok(())
}

fn dump_alerts(path: &PathBuf, min_score: f64) -> Result<(), String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;

    let mut shown = 0usize;
    let mut skipped = 0usize;
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("line {}: not valid JSON ({e})", idx + 1);
                continue;
            }
        };
        let score = value["anomaly_score"].as_f64().unwrap_or(0.0);
        if score < min_score {
            skipped += 1;
            continue;
        }
        shown += 1;
        println!(
            "{}  [{}] {}  score={:.3}  ip={}  path={}",
            format_ts(value["timestamp_ms"].as_u64().unwrap_or(0)),
            value["detection_tier"].as_str().unwrap_or("?"),
            value["alert_reason"].as_str().unwrap_or("?"),
            score,
            value["log_context"]["source_ip"].as_str().unwrap_or("?"),
            value["log_context"]["request_path"].as_str().unwrap_or("?"),
        );
    }
    println!("{shown} alert(s) shown, {skipped} below score threshold");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let result = match &args.command {
        Command::State { path, limit } => dump_state(path, *limit),
        Command::Alerts { path, min_score } => dump_alerts(path, *min_score),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
