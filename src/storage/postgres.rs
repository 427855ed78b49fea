use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::PostgresSettings;
use crate::pipeline::DataCell;
use crate::storage::{storage_name, DataSink, SinkKind};

/// Relational sink: one table per spider, items stored as JSONB
pub struct PostgresSink {
    /// PostgreSQL connection pool
    pool: Pool<Postgres>,

    /// Schema name
    schema: String,

    /// Table prefix
    table_prefix: String,

    /// Tables already created during this run
    ensured: Mutex<HashSet<String>>,
}

impl PostgresSink {
    pub async fn new(settings: &PostgresSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .connect(&settings.connection_string)
            .await
            .context(format!(
                "Failed to connect to PostgreSQL: {}",
                settings.connection_string
            ))?;

        let sink = Self {
            pool,
            schema: storage_name(&settings.schema_name),
            table_prefix: storage_name(&settings.table_prefix),
            ensured: Mutex::new(HashSet::new()),
        };

        sink.ensure_schema().await?;
        debug!("Connected to PostgreSQL database");

        Ok(sink)
    }

    /// Ensure the schema exists
    async fn ensure_schema(&self) -> Result<()> {
        let query = format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema);

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .context(format!("Failed to create schema: {}", self.schema))?;

        Ok(())
    }

    /// Ensure the spider's table exists
    async fn ensure_table(&self, table_name: &str) -> Result<()> {
        let mut ensured = self.ensured.lock().await;
        if ensured.contains(table_name) {
            return Ok(());
        }

        let query = format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (
                id BIGSERIAL PRIMARY KEY,
                rule_name TEXT NOT NULL,
                url TEXT NOT NULL,
                parent_url TEXT NOT NULL,
                download_time TEXT NOT NULL,
                data JSONB NOT NULL
            )",
            self.schema, table_name
        );

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .context(format!("Failed to create table: {}", table_name))?;

        debug!("Ensured table exists: {}.{}", self.schema, table_name);
        ensured.insert(table_name.to_string());
        Ok(())
    }
}

fn table_name(prefix: &str, spider: &str) -> String {
    format!("{}_{}", prefix, storage_name(spider))
}

#[async_trait]
impl DataSink for PostgresSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Postgres
    }

    async fn write_batch(&self, spider: &str, cells: &[DataCell]) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }

        let table = table_name(&self.table_prefix, spider);
        self.ensure_table(&table).await?;

        let query = format!(
            "INSERT INTO {}.{} (rule_name, url, parent_url, download_time, data)
             VALUES ($1, $2, $3, $4, $5)",
            self.schema, table
        );

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for cell in cells {
            sqlx::query(&query)
                .bind(&cell.rule_name)
                .bind(&cell.url)
                .bind(&cell.parent_url)
                .bind(&cell.download_time)
                .bind(Json(&cell.data))
                .execute(&mut *tx)
                .await
                .context("Failed to store data cell in PostgreSQL")?;
        }
        tx.commit().await.context("Failed to commit data cells")?;

        debug!("Stored {} rows in {}.{}", cells.len(), self.schema, table);
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Failed to reach PostgreSQL")?;
        self.ensured.lock().await.clear();
        Ok(())
    }
}
