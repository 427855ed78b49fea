pub mod jsonl;
pub mod memory;
pub mod mongo;
pub mod postgres;
pub mod queue;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pipeline::DataCell;

// Re-export common types
pub use jsonl::JsonLinesSink;
pub use memory::MemorySink;
pub use mongo::MongoSink;
pub use postgres::PostgresSink;
pub use queue::RedisSink;
pub use registry::SinkRegistry;

/// Output backends known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum)]
pub enum SinkKind {
    /// One JSON document per line, one file per spider
    #[serde(rename = "jsonl")]
    #[value(name = "jsonl")]
    JsonLines,
    /// Kept in process memory
    #[serde(rename = "memory")]
    #[value(name = "memory")]
    Memory,
    #[serde(rename = "mongodb")]
    #[value(name = "mongodb")]
    MongoDb,
    #[serde(rename = "postgres")]
    #[value(name = "postgres")]
    Postgres,
    #[serde(rename = "redis")]
    #[value(name = "redis")]
    Redis,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::JsonLines => "jsonl",
            SinkKind::Memory => "memory",
            SinkKind::MongoDb => "mongodb",
            SinkKind::Postgres => "postgres",
            SinkKind::Redis => "redis",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of a spider's data cells.
///
/// One sink instance is shared by every pipeline of a run; `spider` names the
/// collection, table, file or key the batch belongs to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataSink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Persist one batch of cells
    async fn write_batch(&self, spider: &str, cells: &[DataCell]) -> Result<()>;

    /// Re-establish connections; called before a failed batch is retried
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Turn a spider name into an identifier usable as a table or collection name
pub(crate) fn storage_name(spider: &str) -> String {
    let name: String = spider
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if name.is_empty() {
        "unnamed".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_kind_names() {
        let kind: SinkKind = serde_yaml::from_str("mongodb").unwrap();
        assert_eq!(kind, SinkKind::MongoDb);
        assert_eq!(SinkKind::JsonLines.to_string(), "jsonl");
        assert_eq!(serde_json::to_string(&SinkKind::Redis).unwrap(), "\"redis\"");
    }

    #[test]
    fn test_storage_name() {
        assert_eq!(storage_name("Books-2024 (EU)"), "books_2024__eu_");
        assert_eq!(storage_name(""), "unnamed");
    }
}
