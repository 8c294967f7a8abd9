//! File source with tail semantics.
//!
//! Reads up to a batch cap of lines per call and clears the EOF state
//! afterwards so a growing file can be re-read on the next call.
//! Detects truncation (log rotation that reuses the same path) and
//! restarts from the beginning of the new file. The byte offset is
//! persisted to a small cursor file so restarts resume.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{BATCH_SIZE, Batch, LogSource, SourceError};
use crate::model::LogRecord;

pub struct FileLogSource {
    path: PathBuf,
    cursor_path: Option<PathBuf>,
    reader: BufReader<File>,
    offset: u64,
    line_number: u64,
    batch_size: usize,
}

impl FileLogSource {
    /// Open a log file. When `cursor_path` is given and holds a valid
    /// offset within the file, reading resumes there; otherwise it
    /// starts at the beginning.
    pub fn open(path: &Path, cursor_path: Option<&Path>) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut offset = 0;
        let mut line_number = 0;
        if let Some(cursor) = cursor_path
            && let Some((saved_offset, saved_line)) = read_cursor(cursor)
        {
            if saved_offset <= len {
                offset = saved_offset;
                line_number = saved_line;
                info!("resuming {} at byte {offset} (line {line_number})", path.display());
            } else {
                warn!(
                    "cursor offset {saved_offset} beyond file length {len}; starting over"
                );
            }
        }
        reader.seek(SeekFrom::Start(offset))?;

        Ok(Self {
            path: path.to_path_buf(),
            cursor_path: cursor_path.map(Path::to_path_buf),
            reader,
            offset,
            line_number,
            batch_size: BATCH_SIZE,
        })
    }

    #[cfg(test)]
    fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// Truncation check: a file shorter than our offset was rotated in
    /// place. Reopen from the start.
    fn detect_truncation(&mut self) -> std::io::Result<()> {
        let len = std::fs::metadata(&self.path)?.len();
        if len < self.offset {
            warn!("{} truncated ({} < {}); re-reading", self.path.display(), len, self.offset);
            let file = File::open(&self.path)?;
            self.reader = BufReader::new(file);
            self.offset = 0;
        }
        Ok(())
    }
}

impl LogSource for FileLogSource {
    fn next_batch(&mut self) -> Result<Batch, SourceError> {
        self.detect_truncation()?;

        let mut batch = Batch::default();
        let mut line = String::new();
        while batch.records.len() < self.batch_size {
            line.clear();
            let read = self.reader.read_line(&mut line)?;
            if read == 0 {
                // EOF: tail mode, the stream stays usable. A partial
                // final line (no newline yet) is left for later too —
                // rewind so the writer can finish it.
                break;
            }
            if !line.ends_with('\n') {
                self.reader.seek(SeekFrom::Start(self.offset))?;
                break;
            }
            self.offset += read as u64;
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            self.line_number += 1;
            match LogRecord::parse(trimmed, self.line_number) {
                Some(record) => batch.records.push(record),
                None => batch.malformed += 1,
            }
        }
        Ok(batch)
    }

    fn persist_cursor(&mut self) -> std::io::Result<()> {
        let Some(cursor) = &self.cursor_path else {
            return Ok(());
        };
        if let Some(parent) = cursor.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(cursor, format!("{} {}\n", self.offset, self.line_number))
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

fn read_cursor(path: &Path) -> Option<(u64, u64)> {
    let text = std::fs::read_to_string(path).ok()?;
    let mut parts = text.split_whitespace();
    let offset = parts.next()?.parse().ok()?;
    let line = parts.next()?.parse().ok()?;
    Some((offset, line))
}
