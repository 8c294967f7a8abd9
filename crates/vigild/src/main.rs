//! vigild - Access-log anomaly detector daemon.
//!
//! Pulls batches from the configured log source, runs the analysis
//! engine and the detection cascade, and hands alerts to the alert
//! manager. The memory manager and the operational API each run on
//! their own thread.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use vigil_core::alerts::{AlertManager, build_dispatchers};
use vigil_core::analysis::AnalysisEngine;
use vigil_core::api::{AlertView, EngineStateView};
use vigil_core::config::AppConfig;
use vigil_core::memory::MemoryManager;
use vigil_core::metrics::MetricsRegistry;
use vigil_core::rules::{DetectionTier, RuleEngine, tier1, tier2, tier3, tier4};
use vigil_core::source::{DbLogSource, FileLogSource, LogSource, SourceError};
use vigil_core::state::snapshot;

/// Backoff applied when the source reports itself unavailable.
const SOURCE_BACKOFF: Duration = Duration::from_secs(5);

/// Access-log anomaly detector daemon.
#[derive(Parser)]
#[command(name = "vigild", about = "Access-log anomaly detector daemon", version = vigil_core::VERSION)]
struct Args {
    /// Path to the INI configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Listen address for the operational API. Empty string disables it.
    #[arg(long, default_value = "127.0.0.1:9870")]
    listen: String,

    /// Drain the source once and exit instead of tailing.
    #[arg(long)]
    once: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("vigild={}", level).parse().unwrap())
        .add_directive(format!("vigil_core={}", level).parse().unwrap())
        .add_directive(format!("vigil_web={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Sleep in 100 ms steps so the shutdown flag stays responsive.
fn sleep_with_polls(total: Duration, running: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
        std::thread::sleep(step.min(remaining));
        remaining = remaining.saturating_sub(step);
    }
}

fn open_source(cfg: &AppConfig) -> Result<Box<dyn LogSource>, SourceError> {
    let cursor = Path::new(&cfg.reader_state_path);
    match cfg.log_source_type.as_str() {
        "database" => Ok(Box::new(DbLogSource::new(cfg.database.clone(), cursor))),
        _ => Ok(Box::new(FileLogSource::open(
            Path::new(&cfg.log_input_path),
            Some(cursor),
        )?)),
    }
}

/// Build the cascade, wiring Tier 3's normalization parameters into
/// the engine's feature manager when its model loads.
fn build_rules(cfg: &AppConfig, engine: &mut AnalysisEngine) -> RuleEngine {
    let mut tiers: Vec<Box<dyn DetectionTier>> = Vec::new();
    if cfg.tier1.enabled {
        tiers.push(Box::new(tier1::HeuristicTier::new(cfg.tier1.clone())));
    }
    if cfg.tier2.enabled {
        tiers.push(Box::new(tier2::StatisticalTier::new(cfg.tier2.clone())));
    }
    if cfg.tier3.enabled {
        match tier3::MlTier::from_metadata_file(&cfg.tier3) {
            Ok(tier) => {
                engine
                    .feature_manager_mut()
                    .set_normalization(tier.normalization());
                info!("ml tier enabled from {}", cfg.tier3.model_metadata_path);
                tiers.push(Box::new(tier));
            }
            Err(e) => warn!("ml tier disabled: {e}"),
        }
    }
    if cfg.tier4.enabled {
        info!("external tier querying {}", cfg.tier4.endpoint_url);
        tiers.push(Box::new(tier4::ExternalTier::new(cfg.tier4.clone())));
    }
    RuleEngine::with_tiers(tiers)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("vigild {} starting", vigil_core::VERSION);

    let cfg = match AppConfig::load(&args.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Config: source={}, window={}s, throttle={}s",
        cfg.log_source_type,
        cfg.tier1.sliding_window_duration_seconds,
        cfg.alert_throttle_duration_seconds
    );

    let registry = Arc::new(MetricsRegistry::new());
    let events_total = registry
        .register_counter("ad_events_processed_total", "Log records analyzed.", &[])
        .expect("fresh registry");
    let parse_failures_total = registry
        .register_counter(
            "ad_parse_failures_total",
            "Lines dropped as malformed.",
            &[],
        )
        .expect("fresh registry");
    let events_dropped_total = registry
        .register_counter(
            "ad_events_dropped_total",
            "Events skipped under critical memory pressure.",
            &[],
        )
        .expect("fresh registry");
    let batch_fetch_seconds = registry
        .register_histogram(
            "ad_log_reader_batch_fetch_duration_seconds",
            "Latency of fetching a batch from the source.",
            &["type"],
        )
        .expect("fresh registry");

    let memory = Arc::new(MemoryManager::new(
        (cfg.memory_limit_mb as usize) * 1024 * 1024,
    ));

    let mut engine = AnalysisEngine::new(Arc::clone(&cfg), Arc::clone(&memory));

    // Best-effort state restore.
    if cfg.state_persistence_enabled {
        let path = Path::new(&cfg.state_file_path);
        if path.exists() {
            match snapshot::load(path, &cfg.tier1) {
                Ok(entries) => engine.restore_ip_states(entries, vigil_core::util::now_ms()),
                Err(e) => warn!("ignoring unreadable state snapshot: {e}"),
            }
        }
    }

    let mut rules = build_rules(&cfg, &mut engine);
    info!("detection cascade: {} tier(s)", rules.tier_count());

    let alert_manager = match AlertManager::new(
        &registry,
        cfg.alert_throttle_duration_seconds * 1000,
        cfg.alert_throttle_max_alerts,
        cfg.alerts_to_stdout,
    ) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("metrics registration failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    alert_manager.start(build_dispatchers(&cfg.alerting));

    let mut source: Box<dyn LogSource> = match open_source(&cfg) {
        Ok(source) => source,
        Err(e) => {
            error!("cannot open log source: {e}");
            return ExitCode::FAILURE;
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let r = Arc::clone(&running);
        if let Err(e) = ctrlc::set_handler(move || {
            info!("received shutdown signal");
            r.store(false, Ordering::SeqCst);
        }) {
            warn!("failed to set signal handler: {e}");
        }
    }

    let memory_thread = memory.spawn(Arc::clone(&running));

    let engine = Arc::new(Mutex::new(engine));

    // Operational API on its own thread.
    if !args.listen.is_empty() {
        let state = vigil_web::ApiState {
            registry: Arc::clone(&registry),
            memory: Arc::clone(&memory),
            recent_alerts: {
                let manager = Arc::clone(&alert_manager);
                Arc::new(move |limit| {
                    manager
                        .recent_alerts(limit)
                        .iter()
                        .map(AlertView::from)
                        .collect()
                })
            },
            engine_state: {
                let engine = Arc::clone(&engine);
                Arc::new(move || {
                    let engine = engine.lock().unwrap();
                    let (active, errors) = engine.top_ips(10);
                    let sizes = (
                        engine.ip_states.len(),
                        engine.path_states.len(),
                        engine.session_states.len(),
                    );
                    EngineStateView::build(engine.stats(), sizes, active, errors)
                })
            },
        };
        let listen = args.listen.clone();
        std::thread::Builder::new()
            .name("vigil-web".to_string())
            .spawn(move || {
                if let Err(e) = vigil_web::serve(state, &listen) {
                    error!("operational API failed: {e}");
                }
            })
            .expect("spawn web thread");
    }

    info!("starting ingest loop");
    let mut events_since_save: u64 = 0;
    let mut last_dropped: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let fetch_started = Instant::now();
        let batch = source.next_batch();
        batch_fetch_seconds.observe(&[source.kind()], fetch_started.elapsed().as_secs_f64());

        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                warn!("log source error, backing off: {e}");
                if let Err(e) = source.persist_cursor() {
                    warn!("cursor persist failed: {e}");
                }
                sleep_with_polls(SOURCE_BACKOFF, &running);
                continue;
            }
        };

        if batch.malformed > 0 {
            parse_failures_total.increment(&[], batch.malformed);
        }

        if batch.records.is_empty() {
            if args.once {
                info!("source drained, exiting (--once)");
                break;
            }
            sleep_with_polls(
                Duration::from_secs(cfg.live_monitoring_sleep_seconds),
                &running,
            );
            continue;
        }

        let record_count = batch.records.len() as u64;
        {
            let mut engine = engine.lock().unwrap();
            let events = engine.process_batch(batch.records);
            events_total.increment(&[], record_count);

            let stats = engine.stats();
            if stats.total_dropped > last_dropped {
                events_dropped_total.increment(&[], stats.total_dropped - last_dropped);
                last_dropped = stats.total_dropped;
            }
            drop(engine);

            for event in &events {
                for alert in rules.evaluate(event) {
                    alert_manager.record_alert(alert);
                }
            }
        }

        if let Err(e) = source.persist_cursor() {
            warn!("cursor persist failed: {e}");
        }

        // Periodic best-effort state snapshot.
        if cfg.state_persistence_enabled {
            events_since_save += record_count;
            if events_since_save >= cfg.state_save_interval_events {
                events_since_save = 0;
                save_state(&cfg, &engine);
            }
        }

        debug!("batch of {record_count} processed");
    }

    info!("shutting down...");
    alert_manager.shutdown();
    if let Err(e) = source.persist_cursor() {
        warn!("final cursor persist failed: {e}");
    }
    if cfg.state_persistence_enabled {
        save_state(&cfg, &engine);
    }
    let _ = memory_thread.join();

    info!("shutdown complete");
    ExitCode::SUCCESS
}

fn save_state(cfg: &AppConfig, engine: &Arc<Mutex<AnalysisEngine>>) {
    let engine = engine.lock().unwrap();
    let table = engine.ip_states.lock();
    match snapshot::save(Path::new(&cfg.state_file_path), &table) {
        Ok(()) => debug!("state snapshot written to {}", cfg.state_file_path),
        Err(e) => warn!("state snapshot failed: {e}"),
    }
}
