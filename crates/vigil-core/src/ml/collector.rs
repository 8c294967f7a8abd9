//! Training-data collection.
//!
//! When enabled, each analyzed event's raw feature vector is buffered
//! and appended to a CSV file in micro-batches, one block per flush.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::features::{FEATURE_VECTOR_SIZE, FeatureManager};
use crate::model::AnalyzedEvent;

/// Rows buffered before a block append.
const MICRO_BATCH: usize = 64;

pub struct MlDataCollector {
    path: PathBuf,
    buffer: Vec<[f64; FEATURE_VECTOR_SIZE]>,
    header_written: bool,
}

impl MlDataCollector {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            buffer: Vec::with_capacity(MICRO_BATCH),
            header_written: path.exists(),
        }
    }

    pub fn collect(&mut self, event: &AnalyzedEvent) {
        let raw = FeatureManager::extract_raw(event);
        let mut row = [0.0; FEATURE_VECTOR_SIZE];
        row.copy_from_slice(&raw);
        self.buffer.push(row);
        if self.buffer.len() >= MICRO_BATCH {
            self.flush();
        }
    }

    /// Append the buffered rows as one block. Write failures are
    /// logged and the rows dropped; collection is best-effort.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(e) = self.write_block() {
            warn!("ml data collection append failed: {e}");
        }
        self.buffer.clear();
    }

    fn write_block(&mut self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;

        let mut block = String::with_capacity(self.buffer.len() * FEATURE_VECTOR_SIZE * 8);
        if !self.header_written {
            let header: Vec<String> = (0..FEATURE_VECTOR_SIZE).map(|i| format!("f{i}")).collect();
            block.push_str(&header.join(","));
            block.push('\n');
            self.header_written = true;
        }
        for row in &self.buffer {
            let cells: Vec<String> = row.iter().map(|v| format!("{v}")).collect();
            block.push_str(&cells.join(","));
            block.push('\n');
        }
        file.write_all(block.as_bytes())
    }
}

impl Drop for MlDataCollector {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogRecord;
    use std::sync::Arc;

    fn event() -> AnalyzedEvent {
        let line = "1.2.3.4 - - [01/Jan/2026:00:00:00 +0000] \"GET /x HTTP/1.1\" 200 512 \"-\" \"ua\"";
        AnalyzedEvent::new(Arc::new(LogRecord::parse(line, 1).unwrap()))
    }

    #[test]
    fn test_micro_batch_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ml/train.csv");
        let mut collector = MlDataCollector::new(&path);
        for _ in 0..MICRO_BATCH {
            collector.collect(&event());
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), MICRO_BATCH + 1, "header plus one block");
        assert!(lines[0].starts_with("f0,f1,"));
        assert_eq!(lines[1].split(',').count(), FEATURE_VECTOR_SIZE);
    }

    #[test]
    fn test_flush_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        {
            let mut collector = MlDataCollector::new(&path);
            collector.collect(&event());
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
