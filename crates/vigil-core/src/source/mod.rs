//! Log sources: pull adapters producing bounded batches of parsed
//! records with resumable cursors.

pub mod db;
pub mod file;

pub use db::DbLogSource;
pub use file::FileLogSource;

use crate::model::LogRecord;

/// Default batch cap per `next_batch` call.
pub const BATCH_SIZE: usize = 1_000;

#[derive(Debug)]
pub enum SourceError {
    Io(std::io::Error),
    /// Backend (database) unavailable; the ingest loop backs off.
    Unavailable(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "source i/o error: {e}"),
            Self::Unavailable(msg) => write!(f, "source unavailable: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Outcome of one batch pull.
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<LogRecord>,
    /// Lines that failed to parse in this pull.
    pub malformed: u64,
}

pub trait LogSource {
    /// Pull up to [`BATCH_SIZE`] parsed records. An empty batch means
    /// the source is currently drained (tail mode keeps it readable).
    fn next_batch(&mut self) -> Result<Batch, SourceError>;

    /// Persist the reader cursor so a restart resumes where we left
    /// off. A no-op for sources without durable cursors.
    fn persist_cursor(&mut self) -> std::io::Result<()>;

    /// Human-readable source kind for logs and metrics labels.
    fn kind(&self) -> &'static str;
}
