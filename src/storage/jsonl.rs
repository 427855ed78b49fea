use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::pipeline::DataCell;
use crate::storage::{storage_name, DataSink, SinkKind};

/// Appends cells as JSON lines to `<dir>/<spider>.jsonl`
#[derive(Debug)]
pub struct JsonLinesSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File the given spider's cells are appended to
    pub fn file_for(&self, spider: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", storage_name(spider)))
    }
}

#[async_trait]
impl DataSink for JsonLinesSink {
    fn kind(&self) -> SinkKind {
        SinkKind::JsonLines
    }

    async fn write_batch(&self, spider: &str, cells: &[DataCell]) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }

        let mut buffer = String::new();
        for cell in cells {
            let line = serde_json::to_string(cell).context("Failed to serialize data cell")?;
            buffer.push_str(&line);
            buffer.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir)
            .await
            .context(format!("Failed to create directory: {}", self.dir.display()))?;

        let path = self.file_for(spider);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(format!("Failed to open output file: {}", path.display()))?;

        file.write_all(buffer.as_bytes())
            .await
            .context(format!("Failed to write output file: {}", path.display()))?;
        file.flush().await?;

        debug!("Appended {} cells to {}", cells.len(), path.display());
        Ok(())
    }
}
