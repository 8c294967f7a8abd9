//! Database cursor source.
//!
//! Queries an access-log table for rows with `timestamp > last seen`,
//! ascending, capped at the batch size. After each batch the maximum
//! observed timestamp is persisted to a small state file so restarts
//! resume where they stopped.

use std::path::{Path, PathBuf};

use postgres::{Client, NoTls, Row};
use tracing::{info, warn};

use super::{Batch, LogSource, SourceError};
use crate::config::DatabaseConfig;
use crate::model::{HttpMethod, LogRecord};

pub struct DbLogSource {
    config: DatabaseConfig,
    state_path: PathBuf,
    client: Option<Client>,
    last_timestamp_ms: u64,
    line_number: u64,
}

impl DbLogSource {
    /// Create the source and load the persisted cursor. The connection
    /// is established lazily so an unreachable database surfaces as a
    /// retryable `Unavailable`, not a startup failure.
    pub fn new(config: DatabaseConfig, state_path: &Path) -> Self {
        let last_timestamp_ms = read_state(state_path).unwrap_or(0);
        info!(
            "database source will read rows after timestamp {last_timestamp_ms}"
        );
        Self {
            config,
            state_path: state_path.to_path_buf(),
            client: None,
            last_timestamp_ms,
            line_number: 0,
        }
    }

    pub fn last_timestamp_ms(&self) -> u64 {
        self.last_timestamp_ms
    }

    fn ensure_client(&mut self) -> Result<&mut Client, SourceError> {
        if self.client.is_none() {
            let client = Client::connect(&self.config.connection_string, NoTls)
                .map_err(|e| SourceError::Unavailable(e.to_string()))?;
            info!("connected to log database");
            self.client = Some(client);
        }
        Ok(self.client.as_mut().expect("just connected"))
    }

    fn row_to_record(&mut self, row: &Row) -> LogRecord {
        self.line_number += 1;
        let timestamp_ms: i64 = row
            .try_get(self.config.timestamp_column.as_str())
            .unwrap_or(0);
        let status: i32 = row.try_get("status").unwrap_or(0);
        let bytes_sent: i64 = row.try_get("bytes_sent").unwrap_or(0);
        let method: String = row.try_get("method").unwrap_or_default();
        let path: String = row.try_get("path").unwrap_or_default();

        LogRecord {
            line_number: self.line_number,
            timestamp_ms: timestamp_ms.max(0) as u64,
            ip: row.try_get("ip").unwrap_or_default(),
            method: HttpMethod::parse(&method),
            path: path.clone(),
            protocol: row.try_get("protocol").unwrap_or_default(),
            status: status.clamp(0, u16::MAX as i32) as u16,
            bytes_sent: bytes_sent.max(0) as u64,
            request_time_s: row.try_get("request_time_s").ok(),
            upstream_time_s: row.try_get("upstream_time_s").ok(),
            user_agent: row.try_get("user_agent").unwrap_or_default(),
            referer: row.try_get("referer").unwrap_or_default(),
            host: row.try_get("host").unwrap_or_default(),
            country_code: row.try_get("country_code").unwrap_or_default(),
            request_id: row.try_get("request_id").unwrap_or_default(),
            accept_encoding: row.try_get("accept_encoding").unwrap_or_default(),
            successfully_parsed: true,
            raw_sample: format!("{method} {path} {status}"),
        }
    }
}

impl LogSource for DbLogSource {
    fn next_batch(&mut self) -> Result<Batch, SourceError> {
        let query = format!(
            "SELECT * FROM {} WHERE {} > $1 ORDER BY {} ASC LIMIT $2",
            self.config.table, self.config.timestamp_column, self.config.timestamp_column
        );
        let last = self.last_timestamp_ms as i64;
        let limit = self.config.batch_size as i64;

        let rows = {
            let client = self.ensure_client()?;
            match client.query(&query, &[&last, &limit]) {
                Ok(rows) => rows,
                Err(e) => {
                    // Drop the connection; the next call reconnects.
                    self.client = None;
                    return Err(SourceError::Unavailable(e.to_string()));
                }
            }
        };

        let mut batch = Batch::default();
        for row in &rows {
            let record = self.row_to_record(row);
            if record.timestamp_ms > self.last_timestamp_ms {
                self.last_timestamp_ms = record.timestamp_ms;
            }
            if record.ip.is_empty() || record.timestamp_ms == 0 {
                batch.malformed += 1;
                continue;
            }
            batch.records.push(record);
        }

        if !batch.records.is_empty()
            && let Err(e) = self.persist_cursor()
        {
            warn!("failed to persist database cursor: {e}");
        }
        Ok(batch)
    }

    fn persist_cursor(&mut self) -> std::io::Result<()> {
        if let Some(parent) = self.state_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.state_path, format!("{}\n", self.last_timestamp_ms))
    }

    fn kind(&self) -> &'static str {
        "database"
    }
}

fn read_state(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
