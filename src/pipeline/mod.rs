pub mod output;

use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crawler::response::{FileCell, Item};

// Re-export common types
pub use output::OutputPipeline;

/// Timestamp format of [`DataCell::download_time`]
pub const DOWNLOAD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One extracted item plus its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCell {
    pub rule_name: String,
    pub data: Item,
    pub url: String,
    pub parent_url: String,
    pub download_time: String,
}

impl DataCell {
    /// Build a cell stamped with the current local time
    pub fn new(
        rule_name: impl Into<String>,
        data: Item,
        url: impl Into<String>,
        parent_url: impl Into<String>,
    ) -> Self {
        Self {
            rule_name: rule_name.into(),
            data,
            url: url.into(),
            parent_url: parent_url.into(),
            download_time: Local::now().format(DOWNLOAD_TIME_FORMAT).to_string(),
        }
    }
}

/// Counts returned by [`Pipeline::drain`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub data_written: usize,
    pub files_written: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn merge(&mut self, other: DrainReport) {
        self.data_written += other.data_written;
        self.files_written += other.files_written;
        self.failed += other.failed;
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline has not been started")]
    NotStarted,

    #[error("pipeline is closed")]
    Closed,

    #[error("collector task failed: {0}")]
    Collector(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-spider output collector.
///
/// `collect_*` may be called concurrently from many processing tasks. After
/// [`Pipeline::drain`] every later collect call fails with [`PipelineError::Closed`].
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn start(&self) -> Result<(), PipelineError>;

    async fn collect_data(&self, cell: DataCell) -> Result<(), PipelineError>;

    async fn collect_file(&self, rule_name: &str, file: FileCell) -> Result<(), PipelineError>;

    /// Flush everything buffered and close the pipeline
    async fn drain(&self) -> Result<DrainReport, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    #[test]
    fn test_data_cell_timestamp_format() {
        let cell = DataCell::new("list", Item::new(), "https://a/1", "https://a/");
        assert!(NaiveDateTime::parse_from_str(&cell.download_time, DOWNLOAD_TIME_FORMAT).is_ok());
        assert_eq!(cell.download_time.len(), 19);
    }

    #[test]
    fn test_drain_report_merge() {
        let mut total = DrainReport::default();
        total.merge(DrainReport { data_written: 2, files_written: 1, failed: 0 });
        total.merge(DrainReport { data_written: 3, files_written: 0, failed: 4 });
        assert_eq!(total, DrainReport { data_written: 5, files_written: 1, failed: 4 });
    }
}
