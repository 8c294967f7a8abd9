//! Alert sinks: NDJSON file, syslog UDP, HTTP webhook.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::config::AlertingConfig;
use crate::model::Alert;

/// A sink consuming alerts. `dispatch` returns success; failures are
/// counted by the alert manager and never re-enqueued.
pub trait Dispatcher: Send {
    fn kind(&self) -> &'static str;
    fn dispatch(&mut self, alert: &Alert) -> bool;
}

/// Build the configured dispatcher set. A sink that cannot be opened
/// logs a warning and is skipped; the detector keeps running.
pub fn build_dispatchers(cfg: &AlertingConfig) -> Vec<Box<dyn Dispatcher>> {
    let mut dispatchers: Vec<Box<dyn Dispatcher>> = Vec::new();

    if cfg.file_enabled && !cfg.file_output_path.is_empty() {
        match FileDispatcher::open(Path::new(&cfg.file_output_path)) {
            Ok(d) => {
                info!("file dispatcher writing to {}", cfg.file_output_path);
                dispatchers.push(Box::new(d));
            }
            Err(e) => warn!("file dispatcher disabled: {e}"),
        }
    }
    if cfg.syslog_enabled {
        match SyslogDispatcher::new(&cfg.syslog_target) {
            Ok(d) => {
                info!("syslog dispatcher sending to {}", cfg.syslog_target);
                dispatchers.push(Box::new(d));
            }
            Err(e) => warn!("syslog dispatcher disabled: {e}"),
        }
    }
    if cfg.http_enabled && !cfg.http_webhook_url.is_empty() {
        info!("http dispatcher posting to {}", cfg.http_webhook_url);
        dispatchers.push(Box::new(HttpDispatcher::new(
            &cfg.http_webhook_url,
            cfg.http_verify_tls,
        )));
    }
    dispatchers
}

// ============================================================
// File
// ============================================================

/// Appends one NDJSON record per alert, flushing every line.
pub struct FileDispatcher {
    path: PathBuf,
    file: File,
}

impl FileDispatcher {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl Dispatcher for FileDispatcher {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn dispatch(&mut self, alert: &Alert) -> bool {
        let line = alert.to_json().to_string();
        let result = self
            .file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .and_then(|_| self.file.flush());
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("alert append to {} failed: {e}", self.path.display());
                false
            }
        }
    }
}

// ============================================================
// Syslog
// ============================================================

/// RFC 3164 PRI for facility user (1), severity warning (4).
const SYSLOG_PRI_USER_WARNING: u8 = 12;

/// Sends RFC 3164 UDP packets to the local daemon.
pub struct SyslogDispatcher {
    socket: UdpSocket,
    target: String,
}

impl SyslogDispatcher {
    pub fn new(target: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket,
            target: target.to_string(),
        })
    }

    fn format_packet(alert: &Alert) -> String {
        let ts = Utc
            .timestamp_millis_opt(alert.timestamp_ms as i64)
            .single()
            .unwrap_or_else(Utc::now);
        // RFC 3164 TIMESTAMP: "Mmm dd hh:mm:ss" with a space-padded day.
        let stamp = ts.format("%b %e %H:%M:%S");
        format!(
            "<{}>{} vigild[{}]: ALERT: {} | IP: {} | Tier: {} | Score: {:.3}",
            SYSLOG_PRI_USER_WARNING,
            stamp,
            std::process::id(),
            alert.reason,
            alert.source_ip,
            alert.tier.as_str(),
            alert.score
        )
    }
}

impl Dispatcher for SyslogDispatcher {
    fn kind(&self) -> &'static str {
        "syslog"
    }

    fn dispatch(&mut self, alert: &Alert) -> bool {
        let packet = Self::format_packet(alert);
        match self.socket.send_to(packet.as_bytes(), &self.target) {
            Ok(_) => true,
            Err(e) => {
                debug!("syslog send failed: {e}");
                false
            }
        }
    }
}

// ============================================================
// HTTP webhook
// ============================================================

/// Keep-alive connections held by the agent.
const POOL_SIZE: usize = 10;
/// Requests served per keep-alive agent before it is renewed.
const REQUESTS_PER_AGENT: u32 = 100;
/// Attempts per alert, with exponential backoff between them.
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// POSTs the alert JSON to a webhook over a pooled keep-alive agent.
pub struct HttpDispatcher {
    url: String,
    verify_tls: bool,
    agent: ureq::Agent,
    requests_on_agent: u32,
}

fn build_agent(verify_tls: bool) -> ureq::Agent {
    let mut builder = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(5))
        .timeout_read(Duration::from_secs(30))
        .max_idle_connections(POOL_SIZE)
        .max_idle_connections_per_host(POOL_SIZE);
    if !verify_tls {
        // Verification is off by default; operators opt in through
        // `[alerting] http_verify_tls`.
        match native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
        {
            Ok(connector) => {
                builder = builder.tls_connector(Arc::new(connector));
            }
            Err(e) => warn!("tls connector setup failed, keeping verification: {e}"),
        }
    }
    builder.build()
}

impl HttpDispatcher {
    pub fn new(url: &str, verify_tls: bool) -> Self {
        Self {
            url: url.to_string(),
            verify_tls,
            agent: build_agent(verify_tls),
            requests_on_agent: 0,
        }
    }

    /// Renew the agent (and with it every pooled connection) once the
    /// per-connection request budget is spent.
    fn maybe_renew_agent(&mut self) {
        self.requests_on_agent += 1;
        if self.requests_on_agent >= REQUESTS_PER_AGENT {
            self.agent = build_agent(self.verify_tls);
            self.requests_on_agent = 0;
            debug!("http dispatcher renewed its connection pool");
        }
    }
}

impl Dispatcher for HttpDispatcher {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn dispatch(&mut self, alert: &Alert) -> bool {
        self.maybe_renew_agent();
        let body = alert.to_json().to_string();

        let mut backoff = BACKOFF_BASE;
        for attempt in 1..=MAX_ATTEMPTS {
            let result = self
                .agent
                .post(&self.url)
                .set("Content-Type", "application/json")
                .send_string(&body);
            match result {
                Ok(_) => return true,
                Err(e) => {
                    debug!("webhook attempt {attempt}/{MAX_ATTEMPTS} failed: {e}");
                    if attempt < MAX_ATTEMPTS {
                        std::thread::sleep(backoff);
                        backoff *= 2;
                    }
                }
            }
        }
        warn!("webhook delivery to {} failed after {MAX_ATTEMPTS} attempts", self.url);
        false
    }
}
