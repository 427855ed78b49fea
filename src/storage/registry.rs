use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::cli::config::OutputSettings;
use crate::storage::{
    DataSink, JsonLinesSink, MemorySink, MongoSink, PostgresSink, RedisSink, SinkKind,
};

type SinkFactory =
    Arc<dyn Fn(OutputSettings) -> BoxFuture<'static, Result<Arc<dyn DataSink>>> + Send + Sync>;

/// Maps an output kind to the factory that builds its sink
#[derive(Clone, Default)]
pub struct SinkRegistry {
    factories: HashMap<SinkKind, SinkFactory>,
}

impl SinkRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in backend
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SinkKind::JsonLines, |settings| async move {
            Ok(Arc::new(JsonLinesSink::new(settings.jsonl_dir)) as Arc<dyn DataSink>)
        });
        registry.register(SinkKind::Memory, |_| async move {
            Ok(Arc::new(MemorySink::new()) as Arc<dyn DataSink>)
        });
        registry.register(SinkKind::MongoDb, |settings| async move {
            let sink = MongoSink::new(&settings.mongodb).await?;
            Ok(Arc::new(sink) as Arc<dyn DataSink>)
        });
        registry.register(SinkKind::Postgres, |settings| async move {
            let sink = PostgresSink::new(&settings.postgres).await?;
            Ok(Arc::new(sink) as Arc<dyn DataSink>)
        });
        registry.register(SinkKind::Redis, |settings| async move {
            let sink = RedisSink::new(&settings.redis).await?;
            Ok(Arc::new(sink) as Arc<dyn DataSink>)
        });
        registry
    }

    /// Add or replace the factory of `kind`
    pub fn register<F, Fut>(&mut self, kind: SinkKind, factory: F)
    where
        F: Fn(OutputSettings) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn DataSink>>> + Send + 'static,
    {
        self.factories
            .insert(kind, Arc::new(move |settings| factory(settings).boxed()));
    }

    pub fn kinds(&self) -> Vec<SinkKind> {
        let mut kinds: Vec<SinkKind> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Build the sink configured by `settings.out_type`
    pub async fn resolve(&self, settings: &OutputSettings) -> Result<Arc<dyn DataSink>> {
        let kind = settings.out_type;
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| anyhow::anyhow!("Unsupported output type: {}", kind))?;

        let sink = factory(settings.clone())
            .await
            .context(format!("Failed to initialise {} output", kind))?;

        info!("Output sink ready: {}", kind);
        Ok(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockDataSink;

    #[test]
    fn test_defaults_cover_every_kind() {
        let registry = SinkRegistry::with_defaults();
        assert_eq!(
            registry.kinds(),
            vec![
                SinkKind::JsonLines,
                SinkKind::Memory,
                SinkKind::MongoDb,
                SinkKind::Postgres,
                SinkKind::Redis
            ]
        );
    }

    #[tokio::test]
    async fn test_resolve_builds_configured_kind() {
        let registry = SinkRegistry::with_defaults();
        let settings = OutputSettings {
            out_type: SinkKind::Memory,
            ..OutputSettings::default()
        };
        let sink = tokio_test::assert_ok!(registry.resolve(&settings).await);
        assert_eq!(sink.kind(), SinkKind::Memory);
    }

    #[tokio::test]
    async fn test_resolve_unknown_kind_fails() {
        let registry = SinkRegistry::new();
        let settings = OutputSettings::default();
        let error = registry.resolve(&settings).await.err().unwrap();
        assert!(error.to_string().contains("Unsupported output type: jsonl"));
    }

    #[tokio::test]
    async fn test_custom_factory_replaces_default() {
        let mut registry = SinkRegistry::with_defaults();
        registry.register(SinkKind::Redis, |_| async move {
            let mut mock = MockDataSink::new();
            mock.expect_kind().return_const(SinkKind::Redis);
            Ok(Arc::new(mock) as Arc<dyn DataSink>)
        });

        let settings = OutputSettings {
            out_type: SinkKind::Redis,
            ..OutputSettings::default()
        };
        let sink = tokio_test::assert_ok!(registry.resolve(&settings).await);
        assert_eq!(sink.kind(), SinkKind::Redis);
    }

    #[tokio::test]
    async fn test_factory_errors_name_the_output() {
        let mut registry = SinkRegistry::new();
        registry.register(SinkKind::Postgres, |_| async move {
            Err::<Arc<dyn DataSink>, _>(anyhow::anyhow!("connection refused"))
        });

        let settings = OutputSettings {
            out_type: SinkKind::Postgres,
            ..OutputSettings::default()
        };
        let error = registry.resolve(&settings).await.err().unwrap();
        assert!(format!("{:#}", error).contains("Failed to initialise postgres output"));
        assert!(format!("{:#}", error).contains("connection refused"));
    }
}
