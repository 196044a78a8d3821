//! Result persistence for scan records.
//!
//! The sink contract is append-only and crash-safe: every record is flushed
//! before `append` returns, so an interrupted scan leaves a readable file
//! with a header and zero or more complete rows, never a truncated one.

use crate::error::{AptResult, ScanError};
use crate::scan::MeasurementRecord;
use async_trait::async_trait;
use log::info;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Append-only recorder of scan records.
#[async_trait]
pub trait RecordSink: Send {
    /// Create or truncate the backing store and write the header record.
    async fn open(&mut self, schema: &[&str]) -> AptResult<()>;

    /// Persist one record, durably, before returning.
    async fn append(&mut self, record: &MeasurementRecord) -> AptResult<()>;

    /// Release the resource. Calling more than once is fine.
    async fn close(&mut self) -> AptResult<()>;
}

/// CSV sink, one row per grid cell in scan order.
pub struct CsvSink {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    /// Sink writing to `scan_<timestamp>.csv` under `dir`.
    pub fn timestamped_in(dir: impl AsRef<Path>) -> Self {
        let file_name = format!("scan_{}.csv", chrono::Utc::now().format("%Y%m%d_%H%M%S"));
        Self::new(dir.as_ref().join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for CsvSink {
    async fn open(&mut self, schema: &[&str]) -> AptResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(schema)?;
        writer.flush()?;
        self.writer = Some(writer);
        info!("recording scan to '{}'", self.path.display());
        Ok(())
    }

    async fn append(&mut self, record: &MeasurementRecord) -> AptResult<()> {
        let writer = self.writer.as_mut().ok_or(ScanError::SinkClosed)?;
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }

    async fn close(&mut self) -> AptResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!("result sink '{}' closed", self.path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::RECORD_SCHEMA;

    fn record(col: u32, row: u32) -> MeasurementRecord {
        MeasurementRecord {
            col,
            row,
            target_x_um: col as f64 * 0.2,
            target_y_um: row as f64 * 0.1,
            value: 42.0,
        }
    }

    #[tokio::test]
    async fn test_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.csv");
        let mut sink = CsvSink::new(&path);

        sink.open(&RECORD_SCHEMA).await.unwrap();
        sink.append(&record(0, 0)).await.unwrap();
        sink.append(&record(1, 0)).await.unwrap();
        sink.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("col,row,targetX_um,targetY_um,value"));
        assert_eq!(lines.next(), Some("0,0,0.0,0.0,42.0"));
        assert_eq!(lines.next(), Some("1,0,0.2,0.0,42.0"));
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn test_rows_are_readable_without_close() {
        // Every append flushes, so a crash between appends must still leave
        // a complete file behind.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.csv");
        let mut sink = CsvSink::new(&path);

        sink.open(&RECORD_SCHEMA).await.unwrap();
        sink.append(&record(0, 0)).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path().join("scan.csv"));
        sink.open(&RECORD_SCHEMA).await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path().join("scan.csv"));
        sink.open(&RECORD_SCHEMA).await.unwrap();
        sink.close().await.unwrap();
        assert!(matches!(
            sink.append(&record(0, 0)).await,
            Err(ScanError::SinkClosed)
        ));
    }
}
