use anyhow::{Context, Result};
use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::{options::ClientOptions, Client, Collection, Database};
use tracing::debug;

use crate::cli::config::MongoSettings;
use crate::pipeline::DataCell;
use crate::storage::{storage_name, DataSink, SinkKind};

/// Document store sink: one collection per spider
pub struct MongoSink {
    /// MongoDB database
    database: Database,

    /// Collection prefix
    collection_prefix: String,
}

impl MongoSink {
    /// Connect and verify the database is reachable
    pub async fn new(settings: &MongoSettings) -> Result<Self> {
        let client_options = ClientOptions::parse(&settings.connection_string)
            .await
            .context(format!(
                "Failed to parse MongoDB connection string: {}",
                settings.connection_string
            ))?;

        let client = Client::with_options(client_options).context("Failed to create MongoDB client")?;
        let database = client.database(&settings.database_name);

        let sink = Self {
            database,
            collection_prefix: settings.collection_prefix.clone(),
        };
        sink.ping().await?;

        debug!("Connected to MongoDB database: {}", settings.database_name);
        Ok(sink)
    }

    async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .context("Failed to connect to MongoDB")?;
        Ok(())
    }

    fn collection(&self, spider: &str) -> Collection<Document> {
        self.database
            .collection(&collection_name(&self.collection_prefix, spider))
    }
}

fn collection_name(prefix: &str, spider: &str) -> String {
    format!("{}_{}", prefix, storage_name(spider))
}

#[async_trait]
impl DataSink for MongoSink {
    fn kind(&self) -> SinkKind {
        SinkKind::MongoDb
    }

    async fn write_batch(&self, spider: &str, cells: &[DataCell]) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }

        let documents = cells
            .iter()
            .map(mongodb::bson::to_document)
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to convert data cell to BSON document")?;

        self.collection(spider)
            .insert_many(documents, None)
            .await
            .context(format!("Failed to insert {} documents for {}", cells.len(), spider))?;

        debug!("Stored {} documents for spider {}", cells.len(), spider);
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.ping().await
    }
}
