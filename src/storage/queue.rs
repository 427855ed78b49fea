use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::RedisSettings;
use crate::pipeline::DataCell;
use crate::storage::{DataSink, SinkKind};

/// Message queue sink: cells are pushed as JSON onto `<prefix>:<spider>`
pub struct RedisSink {
    /// Redis client
    client: Client,

    key_prefix: String,

    /// List TTL in seconds, 0 disables expiry
    ttl: u64,

    conn: Mutex<MultiplexedConnection>,
}

impl RedisSink {
    pub async fn new(settings: &RedisSettings) -> Result<Self> {
        let client = Client::open(settings.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", settings.redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            client,
            key_prefix: settings.key_prefix.clone(),
            ttl: settings.ttl,
            conn: Mutex::new(conn),
        })
    }

    fn key(&self, spider: &str) -> String {
        list_key(&self.key_prefix, spider)
    }
}

fn list_key(prefix: &str, spider: &str) -> String {
    format!("{}:{}", prefix, spider)
}

#[async_trait]
impl DataSink for RedisSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Redis
    }

    async fn write_batch(&self, spider: &str, cells: &[DataCell]) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }

        let payloads = cells
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to serialize data cell")?;

        let key = self.key(spider);
        let mut conn = self.conn.lock().await;

        redis::cmd("RPUSH")
            .arg(&key)
            .arg(&payloads)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push data cells to Redis")?;

        if self.ttl > 0 {
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(self.ttl)
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to set TTL on output list")?;
        }

        debug!("Pushed {} cells to {}", cells.len(), key);
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        let fresh = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;
        *self.conn.lock().await = fresh;
        Ok(())
    }
}
