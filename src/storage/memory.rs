use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::pipeline::DataCell;
use crate::storage::{DataSink, SinkKind};

/// Sink that keeps every cell in memory, keyed by spider name
#[derive(Debug, Default)]
pub struct MemorySink {
    cells: Mutex<Vec<(String, DataCell)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All cells written so far
    pub async fn cells(&self) -> Vec<(String, DataCell)> {
        self.cells.lock().await.clone()
    }

    /// Cells written for one spider
    pub async fn cells_for(&self, spider: &str) -> Vec<DataCell> {
        self.cells
            .lock()
            .await
            .iter()
            .filter(|(name, _)| name == spider)
            .map(|(_, cell)| cell.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.cells.lock().await.len()
    }
}

#[async_trait]
impl DataSink for MemorySink {
    fn kind(&self) -> SinkKind {
        SinkKind::Memory
    }

    async fn write_batch(&self, spider: &str, cells: &[DataCell]) -> Result<()> {
        let mut stored = self.cells.lock().await;
        stored.extend(cells.iter().map(|cell| (spider.to_string(), cell.clone())));
        Ok(())
    }
}
