//! Detector configuration.
//!
//! INI file with `[section]` headers and `key = value` pairs; `#` and
//! `;` start comments. Keys before the first section header belong to
//! the global section; unknown global keys are kept in a free-form map.
//! Booleans accept `true|1|yes|on` case-insensitively; list values
//! split on commas and trim whitespace.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use tracing::warn;

/// Configuration error that refuses startup.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    /// Line number + message for unparsable content.
    Parse(usize, String),
    /// Invalid or missing mandatory field.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "cannot read config: {e}"),
            Self::Parse(line, msg) => write!(f, "config line {line}: {msg}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ============================================================
// Section configs
// ============================================================

#[derive(Clone, Debug)]
pub struct Tier1Config {
    pub enabled: bool,
    pub sliding_window_duration_seconds: u64,
    pub max_requests_per_ip_in_window: usize,
    pub max_failed_logins_per_ip: usize,
    pub failed_login_status_codes: Vec<u16>,

    pub check_user_agent_anomalies: bool,
    pub headless_browser_strings: Vec<String>,
    pub min_chrome_version: u32,
    pub min_firefox_version: u32,
    pub max_unique_uas_per_ip_in_window: usize,

    pub html_path_suffixes: Vec<String>,
    pub html_exact_paths: Vec<String>,
    pub asset_path_prefixes: Vec<String>,
    pub asset_path_suffixes: Vec<String>,
    pub min_html_requests_for_ratio_check: usize,
    pub min_assets_per_html_ratio: f64,

    pub suspicious_path_substrings: Vec<String>,
    pub suspicious_ua_substrings: Vec<String>,
    pub sensitive_path_substrings: Vec<String>,

    pub session_tracking_enabled: bool,
    pub session_key_components: Vec<String>,
    pub session_inactivity_ttl_seconds: u64,
    pub max_failed_logins_per_session: u32,
    pub max_requests_per_session_in_window: u32,
    pub max_ua_changes_per_session: u32,

    pub score_missing_ua: f64,
    pub score_outdated_browser: f64,
    pub score_known_bad_ua: f64,
    pub score_headless_browser: f64,
    pub score_ua_cycling: f64,
    pub score_suspicious_path: f64,
    pub score_sensitive_path_new_ip: f64,
}

impl Default for Tier1Config {
    fn default() -> Self {
        Self {
            enabled: true,
            sliding_window_duration_seconds: 60,
            max_requests_per_ip_in_window: 100,
            max_failed_logins_per_ip: 5,
            failed_login_status_codes: vec![401, 403],
            check_user_agent_anomalies: true,
            headless_browser_strings: ["HeadlessChrome", "Puppeteer", "PhantomJS", "Selenium"]
                .map(String::from)
                .to_vec(),
            min_chrome_version: 90,
            min_firefox_version: 85,
            max_unique_uas_per_ip_in_window: 3,
            html_path_suffixes: [".html", ".htm", ".php"].map(String::from).to_vec(),
            html_exact_paths: vec!["/".to_string()],
            asset_path_prefixes: ["/static/", "/assets/", "/images/"]
                .map(String::from)
                .to_vec(),
            asset_path_suffixes: [".css", ".js", ".png", ".jpg", ".gif", ".svg", ".ico", ".woff2"]
                .map(String::from)
                .to_vec(),
            min_html_requests_for_ratio_check: 5,
            min_assets_per_html_ratio: 10.0,
            suspicious_path_substrings: Vec::new(),
            suspicious_ua_substrings: Vec::new(),
            sensitive_path_substrings: Vec::new(),
            session_tracking_enabled: true,
            session_key_components: vec!["ip".to_string(), "ua".to_string()],
            session_inactivity_ttl_seconds: 1800,
            max_failed_logins_per_session: 10,
            max_requests_per_session_in_window: 30,
            max_ua_changes_per_session: 2,
            score_missing_ua: 5.0,
            score_outdated_browser: 10.0,
            score_known_bad_ua: 75.0,
            score_headless_browser: 40.0,
            score_ua_cycling: 85.0,
            score_suspicious_path: 95.0,
            score_sensitive_path_new_ip: 80.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Tier2Config {
    pub enabled: bool,
    pub z_score_threshold: f64,
    pub min_samples_for_z_score: u64,
}

impl Default for Tier2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            z_score_threshold: 3.5,
            min_samples_for_z_score: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Tier3Config {
    pub enabled: bool,
    pub model_metadata_path: String,
    pub anomaly_score_threshold: f64,
    pub feature_cache_ttl_seconds: u64,
}

impl Default for Tier3Config {
    fn default() -> Self {
        Self {
            enabled: false,
            model_metadata_path: "models/isolation_forest.json".to_string(),
            anomaly_score_threshold: 0.6,
            feature_cache_ttl_seconds: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Tier4Config {
    pub enabled: bool,
    pub endpoint_url: String,
    /// `name=promql` templates with `${param}` placeholders.
    pub query_templates: Vec<(String, String)>,
    /// `name=value` per-query anomaly thresholds.
    pub anomaly_thresholds: Vec<(String, f64)>,
    pub evaluation_interval_seconds: u64,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
}

impl Default for Tier4Config {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint_url: String::new(),
            query_templates: Vec::new(),
            anomaly_thresholds: Vec::new(),
            evaluation_interval_seconds: 60,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_timeout_seconds: 30,
            connect_timeout_seconds: 5,
            read_timeout_seconds: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AlertingConfig {
    pub file_enabled: bool,
    pub file_output_path: String,
    pub syslog_enabled: bool,
    pub syslog_target: String,
    pub http_enabled: bool,
    pub http_webhook_url: String,
    pub http_verify_tls: bool,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            file_enabled: false,
            file_output_path: "alerts.ndjson".to_string(),
            syslog_enabled: false,
            syslog_target: "127.0.0.1:514".to_string(),
            http_enabled: false,
            http_webhook_url: String::new(),
            http_verify_tls: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub table: String,
    pub timestamp_column: String,
    pub batch_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            table: "access_logs".to_string(),
            timestamp_column: "timestamp_ms".to_string(),
            batch_size: 1000,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub log_source_type: String,
    pub log_input_path: String,
    pub reader_state_path: String,
    pub alerts_to_stdout: bool,
    pub alert_throttle_duration_seconds: u64,
    pub alert_throttle_max_alerts: u64,

    pub state_persistence_enabled: bool,
    pub state_file_path: String,
    pub state_save_interval_events: u64,
    pub live_monitoring_sleep_seconds: u64,

    pub ml_data_collection_enabled: bool,
    pub ml_data_collection_path: String,

    pub memory_limit_mb: u64,
    pub max_ip_states: usize,
    pub max_path_states: usize,
    pub max_session_states: usize,
    pub state_max_idle_seconds: u64,

    pub tier1: Tier1Config,
    pub tier2: Tier2Config,
    pub tier3: Tier3Config,
    pub tier4: Tier4Config,
    pub alerting: AlertingConfig,
    pub database: DatabaseConfig,

    /// Unknown keys from the global section.
    pub custom_settings: HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_source_type: "file".to_string(),
            log_input_path: "data/access.log".to_string(),
            reader_state_path: "data/reader_state.dat".to_string(),
            alerts_to_stdout: true,
            alert_throttle_duration_seconds: 300,
            alert_throttle_max_alerts: 10,
            state_persistence_enabled: false,
            state_file_path: "data/engine_state.dat".to_string(),
            state_save_interval_events: 50_000,
            live_monitoring_sleep_seconds: 5,
            ml_data_collection_enabled: false,
            ml_data_collection_path: "data/training_features.csv".to_string(),
            memory_limit_mb: 512,
            max_ip_states: 50_000,
            max_path_states: 20_000,
            max_session_states: 50_000,
            state_max_idle_seconds: 900,
            tier1: Tier1Config::default(),
            tier2: Tier2Config::default(),
            tier3: Tier3Config::default(),
            tier4: Tier4Config::default(),
            alerting: AlertingConfig::default(),
            database: DatabaseConfig::default(),
            custom_settings: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = Self::parse(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse INI text over the defaults.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut section = String::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let Some(name) = header.strip_suffix(']') else {
                    return Err(ConfigError::Parse(line_no, "unterminated section header".into()));
                };
                section = name.trim().to_ascii_lowercase();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Parse(line_no, format!("expected key = value, got '{line}'")));
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            config
                .apply(&section, &key, value)
                .map_err(|msg| ConfigError::Parse(line_no, msg))?;
        }

        Ok(config)
    }

    fn apply(&mut self, section: &str, key: &str, value: &str) -> Result<(), String> {
        match section {
            "" | "general" => self.apply_global(key, value),
            "tier1" => self.tier1.apply(key, value),
            "tier2" => self.tier2.apply(key, value),
            "tier3" => self.tier3.apply(key, value),
            "tier4" => self.tier4.apply(key, value),
            "alerting" => self.alerting.apply(key, value),
            "database" => self.database.apply(key, value),
            other => {
                warn!("ignoring key '{key}' in unknown section [{other}]");
                Ok(())
            }
        }
    }

    fn apply_global(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "log_source_type" => self.log_source_type = value.to_string(),
            "log_input_path" => self.log_input_path = value.to_string(),
            "reader_state_path" => self.reader_state_path = value.to_string(),
            "alerts_to_stdout" => self.alerts_to_stdout = parse_bool(value)?,
            "alert_throttle_duration_seconds" => {
                self.alert_throttle_duration_seconds = parse_num(value)?
            }
            "alert_throttle_max_alerts" => self.alert_throttle_max_alerts = parse_num(value)?,
            "state_persistence_enabled" => self.state_persistence_enabled = parse_bool(value)?,
            "state_file_path" => self.state_file_path = value.to_string(),
            "state_save_interval_events" => self.state_save_interval_events = parse_num(value)?,
            "live_monitoring_sleep_seconds" => {
                self.live_monitoring_sleep_seconds = parse_num(value)?
            }
            "ml_data_collection_enabled" => self.ml_data_collection_enabled = parse_bool(value)?,
            "ml_data_collection_path" => self.ml_data_collection_path = value.to_string(),
            "memory_limit_mb" => self.memory_limit_mb = parse_num(value)?,
            "max_ip_states" => self.max_ip_states = parse_num(value)?,
            "max_path_states" => self.max_path_states = parse_num(value)?,
            "max_session_states" => self.max_session_states = parse_num(value)?,
            "state_max_idle_seconds" => self.state_max_idle_seconds = parse_num(value)?,
            _ => {
                self.custom_settings
                    .insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_source_type.as_str() {
            "file" => {
                if self.log_input_path.is_empty() {
                    return Err(ConfigError::Invalid(
                        "log_source_type = file requires log_input_path".into(),
                    ));
                }
            }
            "database" => {
                if self.database.connection_string.is_empty() {
                    return Err(ConfigError::Invalid(
                        "log_source_type = database requires [database] connection_string".into(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown log_source_type '{other}' (expected file or database)"
                )));
            }
        }

        if self.alerting.http_enabled && self.alerting.http_webhook_url.is_empty() {
            return Err(ConfigError::Invalid(
                "[alerting] http_enabled requires http_webhook_url".into(),
            ));
        }
        if self.tier4.enabled && self.tier4.endpoint_url.is_empty() {
            return Err(ConfigError::Invalid(
                "[tier4] enabled requires endpoint_url".into(),
            ));
        }
        if self.memory_limit_mb == 0 {
            return Err(ConfigError::Invalid("memory_limit_mb must be positive".into()));
        }
        Ok(())
    }
}

impl Tier1Config {
    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "enabled" => self.enabled = parse_bool(value)?,
            "sliding_window_duration_seconds" => {
                self.sliding_window_duration_seconds = parse_num(value)?
            }
            "max_requests_per_ip_in_window" => {
                self.max_requests_per_ip_in_window = parse_num(value)?
            }
            "max_failed_logins_per_ip" => self.max_failed_logins_per_ip = parse_num(value)?,
            "failed_login_status_codes" => {
                self.failed_login_status_codes = parse_list(value)
                    .iter()
                    .map(|s| s.parse().map_err(|_| format!("bad status code '{s}'")))
                    .collect::<Result<_, _>>()?
            }
            "check_user_agent_anomalies" => self.check_user_agent_anomalies = parse_bool(value)?,
            "headless_browser_strings" => self.headless_browser_strings = parse_list(value),
            "min_chrome_version" => self.min_chrome_version = parse_num(value)?,
            "min_firefox_version" => self.min_firefox_version = parse_num(value)?,
            "max_unique_uas_per_ip_in_window" => {
                self.max_unique_uas_per_ip_in_window = parse_num(value)?
            }
            "html_path_suffixes" => self.html_path_suffixes = parse_list(value),
            "html_exact_paths" => self.html_exact_paths = parse_list(value),
            "asset_path_prefixes" => self.asset_path_prefixes = parse_list(value),
            "asset_path_suffixes" => self.asset_path_suffixes = parse_list(value),
            "min_html_requests_for_ratio_check" => {
                self.min_html_requests_for_ratio_check = parse_num(value)?
            }
            "min_assets_per_html_ratio" => self.min_assets_per_html_ratio = parse_float(value)?,
            "suspicious_path_substrings" => self.suspicious_path_substrings = parse_list(value),
            "suspicious_ua_substrings" => self.suspicious_ua_substrings = parse_list(value),
            "sensitive_path_substrings" => self.sensitive_path_substrings = parse_list(value),
            "session_tracking_enabled" => self.session_tracking_enabled = parse_bool(value)?,
            "session_key_components" => self.session_key_components = parse_list(value),
            "session_inactivity_ttl_seconds" => {
                self.session_inactivity_ttl_seconds = parse_num(value)?
            }
            "max_failed_logins_per_session" => {
                self.max_failed_logins_per_session = parse_num(value)?
            }
            "max_requests_per_session_in_window" => {
                self.max_requests_per_session_in_window = parse_num(value)?
            }
            "max_ua_changes_per_session" => self.max_ua_changes_per_session = parse_num(value)?,
            "score_missing_ua" => self.score_missing_ua = parse_float(value)?,
            "score_outdated_browser" => self.score_outdated_browser = parse_float(value)?,
            "score_known_bad_ua" => self.score_known_bad_ua = parse_float(value)?,
            "score_headless_browser" => self.score_headless_browser = parse_float(value)?,
            "score_ua_cycling" => self.score_ua_cycling = parse_float(value)?,
            "score_suspicious_path" => self.score_suspicious_path = parse_float(value)?,
            "score_sensitive_path_new_ip" => {
                self.score_sensitive_path_new_ip = parse_float(value)?
            }
            _ => warn!("ignoring unknown [tier1] key '{key}'"),
        }
        Ok(())
    }
}

impl Tier2Config {
    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "enabled" => self.enabled = parse_bool(value)?,
            "z_score_threshold" => self.z_score_threshold = parse_float(value)?,
            "min_samples_for_z_score" => self.min_samples_for_z_score = parse_num(value)?,
            _ => warn!("ignoring unknown [tier2] key '{key}'"),
        }
        Ok(())
    }
}

impl Tier3Config {
    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "enabled" => self.enabled = parse_bool(value)?,
            "model_metadata_path" => self.model_metadata_path = value.to_string(),
            "anomaly_score_threshold" => self.anomaly_score_threshold = parse_float(value)?,
            "feature_cache_ttl_seconds" => self.feature_cache_ttl_seconds = parse_num(value)?,
            _ => warn!("ignoring unknown [tier3] key '{key}'"),
        }
        Ok(())
    }
}

impl Tier4Config {
    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "enabled" => self.enabled = parse_bool(value)?,
            "endpoint_url" => self.endpoint_url = value.to_string(),
            "query_templates" => {
                self.query_templates = parse_list(value)
                    .iter()
                    .map(|s| {
                        s.split_once('=')
                            .map(|(n, q)| (n.trim().to_string(), q.trim().to_string()))
                            .ok_or_else(|| format!("bad query template '{s}'"))
                    })
                    .collect::<Result<_, _>>()?
            }
            "anomaly_thresholds" => {
                self.anomaly_thresholds = parse_list(value)
                    .iter()
                    .map(|s| {
                        let (n, v) = s
                            .split_once('=')
                            .ok_or_else(|| format!("bad threshold '{s}'"))?;
                        let v: f64 = v
                            .trim()
                            .parse()
                            .map_err(|_| format!("bad threshold value '{s}'"))?;
                        Ok::<_, String>((n.trim().to_string(), v))
                    })
                    .collect::<Result<_, _>>()?
            }
            "evaluation_interval_seconds" => self.evaluation_interval_seconds = parse_num(value)?,
            "circuit_breaker_failure_threshold" => {
                self.circuit_breaker_failure_threshold = parse_num(value)?
            }
            "circuit_breaker_timeout_seconds" => {
                self.circuit_breaker_timeout_seconds = parse_num(value)?
            }
            "connect_timeout_seconds" => self.connect_timeout_seconds = parse_num(value)?,
            "read_timeout_seconds" => self.read_timeout_seconds = parse_num(value)?,
            _ => warn!("ignoring unknown [tier4] key '{key}'"),
        }
        Ok(())
    }
}

impl AlertingConfig {
    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "file_enabled" => self.file_enabled = parse_bool(value)?,
            "file_output_path" => self.file_output_path = value.to_string(),
            "syslog_enabled" => self.syslog_enabled = parse_bool(value)?,
            "syslog_target" => self.syslog_target = value.to_string(),
            "http_enabled" => self.http_enabled = parse_bool(value)?,
            "http_webhook_url" => self.http_webhook_url = value.to_string(),
            "http_verify_tls" => self.http_verify_tls = parse_bool(value)?,
            _ => warn!("ignoring unknown [alerting] key '{key}'"),
        }
        Ok(())
    }
}

impl DatabaseConfig {
    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "connection_string" => self.connection_string = value.to_string(),
            "table" => self.table = value.to_string(),
            "timestamp_column" => self.timestamp_column = value.to_string(),
            "batch_size" => self.batch_size = parse_num(value)?,
            _ => warn!("ignoring unknown [database] key '{key}'"),
        }
        Ok(())
    }
}

// ============================================================
// Value parsers
// ============================================================

fn strip_comment(line: &str) -> &str {
    match line.find(['#', ';']) {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("bad boolean '{other}'")),
    }
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value.parse().map_err(|_| format!("bad number '{value}'"))
}

fn parse_float(value: &str) -> Result<f64, String> {
    value.parse().map_err(|_| format!("bad number '{value}'"))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
