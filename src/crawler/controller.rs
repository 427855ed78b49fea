use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::{CrawlerSettings, EngineConfig, OutputSettings};
use crate::crawler::scheduler::Scheduler;
use crate::crawler::spider::{Spider, SpiderId};
use crate::crawler::worker::{CrawlSummary, Crawler};
use crate::downloader::{Downloader, HttpDownloader};
use crate::pipeline::{DrainReport, OutputPipeline};
use crate::storage::{storage_name, DataSink, SinkRegistry};
use crate::utils::{PageCounters, PageStats};

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub spiders: Vec<CrawlSummary>,
    /// Crawlers that could not run, as `(spider, cause)`
    pub errors: Vec<(String, String)>,
    /// Spiders never started because a stop was requested first
    pub skipped: Vec<String>,
    pub pages: PageStats,
    pub stopped: bool,
}

impl RunReport {
    /// Output counts of every spider added up
    pub fn output(&self) -> DrainReport {
        let mut total = DrainReport::default();
        for summary in &self.spiders {
            total.merge(summary.output);
        }
        total
    }
}

/// Runs a set of spiders against one shared scheduler.
///
/// At most `max_concurrent_spiders` crawlers run at the same time; the rest wait
/// for a free place in the crawler pool.
pub struct CrawlerController {
    crawler_settings: CrawlerSettings,
    output_settings: OutputSettings,
    scheduler: Arc<Scheduler>,
    downloader: Arc<dyn Downloader>,
    sink: Arc<dyn DataSink>,
    counters: Arc<PageCounters>,
    pool: Arc<Semaphore>,
    handle_interrupt: bool,
}

impl CrawlerController {
    /// Build the HTTP downloader and the configured output sink
    pub async fn from_config(config: &EngineConfig, registry: &SinkRegistry) -> Result<Self> {
        let downloader =
            HttpDownloader::new(&config.downloader).context("Failed to initialise downloader")?;
        let sink = registry.resolve(&config.output).await?;
        Ok(Self::new(config, Arc::new(downloader), sink))
    }

    pub fn new(config: &EngineConfig, downloader: Arc<dyn Downloader>, sink: Arc<dyn DataSink>) -> Self {
        let pool_size = config.crawler.max_concurrent_spiders.max(1);
        Self {
            crawler_settings: config.crawler.clone(),
            output_settings: config.output.clone(),
            scheduler: Arc::new(Scheduler::new(config.crawler.slots)),
            downloader,
            sink,
            counters: Arc::new(PageCounters::new()),
            pool: Arc::new(Semaphore::new(pool_size)),
            handle_interrupt: true,
        }
    }

    /// Do not turn Ctrl-C into a global stop
    pub fn without_interrupt_handler(mut self) -> Self {
        self.handle_interrupt = false;
        self
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn counters(&self) -> Arc<PageCounters> {
        Arc::clone(&self.counters)
    }

    /// Request a global stop of every running crawler
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    fn install_interrupt_handler(&self) -> Option<JoinHandle<()>> {
        if !self.handle_interrupt {
            return None;
        }
        let scheduler = Arc::clone(&self.scheduler);
        Some(tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Interrupt received, stopping all spiders");
                    scheduler.stop();
                }
                Err(e) => error!("Failed to listen for interrupt: {}", e),
            }
        }))
    }

    /// Run every spider to completion, or until a global stop
    pub async fn run(&self, spiders: Vec<Spider>) -> Result<RunReport> {
        check_storage_names(&spiders)?;
        let run_id = Uuid::new_v4();
        info!(
            "Run {}: {} spiders, {} at a time, {} resource slots",
            run_id,
            spiders.len(),
            self.pool.available_permits(),
            self.scheduler.slot_capacity()
        );
        let interrupt = self.install_interrupt_handler();

        let mut handles = Vec::new();
        let mut skipped = Vec::new();
        // Ids only need to be unique within one run
        let mut spiders = spiders
            .into_iter()
            .enumerate()
            .map(|(position, spider)| spider.with_id(SpiderId(position)));

        while let Some(spider) = spiders.next() {
            let permit = Arc::clone(&self.pool)
                .acquire_owned()
                .await
                .context("Crawler pool has been closed")?;

            if self.scheduler.is_stop() {
                skipped.push(spider.name().to_string());
                skipped.extend(spiders.by_ref().map(|spider| spider.name().to_string()));
                break;
            }

            let name = spider.name().to_string();
            let pipeline = Arc::new(OutputPipeline::new(
                spider.name(),
                Arc::clone(&self.sink),
                &self.output_settings,
            ));
            let crawler = Crawler::new(
                spider,
                Arc::clone(&self.scheduler),
                Arc::clone(&self.downloader),
                pipeline,
                Arc::clone(&self.counters),
            )
            .with_settings(&self.crawler_settings);

            debug!("Launching crawler for {}", name);
            handles.push((
                name,
                tokio::spawn(async move {
                    let _permit = permit;
                    crawler.start().await
                }),
            ));
        }

        let mut summaries = Vec::new();
        let mut errors = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(e)) => {
                    error!("Spider {} failed: {:#}", name, e);
                    errors.push((name, format!("{:#}", e)));
                }
                Err(e) => {
                    error!("Crawler task for {} aborted: {}", name, e);
                    errors.push((name, e.to_string()));
                }
            }
        }

        if let Some(interrupt) = interrupt {
            interrupt.abort();
        }

        let report = RunReport {
            run_id,
            spiders: summaries,
            errors,
            skipped,
            pages: self.counters.snapshot(),
            stopped: self.scheduler.is_stop(),
        };
        info!(
            "Run {} finished: {} pages succeeded, {} failed",
            run_id, report.pages.success, report.pages.fail
        );
        Ok(report)
    }
}

/// Spiders of one run must not share an output table, collection, key or directory
fn check_storage_names(spiders: &[Spider]) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for spider in spiders {
        if let Some(other) = seen.insert(storage_name(spider.name()), spider.name()) {
            anyhow::bail!(
                "Spiders '{}' and '{}' would write to the same output '{}'",
                other,
                spider.name(),
                storage_name(spider.name())
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::request::Request;
    use crate::crawler::response::{Item, Response};
    use crate::crawler::spider::{Rule, SpiderRegistry};
    use crate::storage::MemorySink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoDownloader;

    #[async_trait]
    impl Downloader for EchoDownloader {
        async fn download(&self, _spider: &Spider, request: Request) -> Response {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Response::new(request).with_body(200, "ok")
        }
    }

    /// Records the highest number of downloads running at once
    #[derive(Default)]
    struct PeakDownloader {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Downloader for PeakDownloader {
        async fn download(&self, _spider: &Spider, request: Request) -> Response {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Response::new(request).with_body(200, "ok")
        }
    }

    fn config(pool: usize) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.crawler.max_concurrent_spiders = pool;
        config.crawler.slots = 3;
        config.crawler.idle_backoff_ms = 2;
        config.output.batch_size = 4;
        config
    }

    fn spider(name: &str, pages: usize, started: Arc<AtomicUsize>) -> Spider {
        let site = name.to_string();
        Spider::builder(name)
            .root(move |seeder| {
                started.fetch_add(1, Ordering::SeqCst);
                for n in 0..pages {
                    seeder.add_queue(Request::new(format!("https://{}.test/{}", site, n), "page"));
                }
                Ok(())
            })
            .rule(
                "page",
                Rule::new(|ctx| {
                    ctx.output(Item::new());
                    Ok(())
                }),
            )
            .build()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_all_spiders() {
        let sink = Arc::new(MemorySink::new());
        let controller = CrawlerController::new(&config(2), Arc::new(EchoDownloader), sink.clone())
            .without_interrupt_handler();

        let started = Arc::new(AtomicUsize::new(0));
        let mut registry = SpiderRegistry::new();
        registry.register(spider("alpha", 4, started.clone()));
        registry.register(spider("beta", 2, started.clone()));

        let report = controller.run(registry.select(&[]).unwrap()).await.unwrap();

        assert_eq!(report.spiders.len(), 2);
        assert!(report.errors.is_empty());
        assert!(!report.stopped);
        assert_eq!(report.pages.success, 6);
        assert_eq!(report.pages.fail, 0);
        assert_eq!(report.output().data_written, 6);
        assert_eq!(sink.cells_for("alpha").await.len(), 4);
        assert_eq!(sink.cells_for("beta").await.len(), 2);
        assert_eq!(controller.scheduler().active_spiders(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slots_are_shared_by_all_spiders() {
        let mut config = config(3);
        config.crawler.slots = 2;
        let sink = Arc::new(MemorySink::new());
        let downloader = Arc::new(PeakDownloader::default());
        let controller = CrawlerController::new(&config, downloader.clone(), sink.clone())
            .without_interrupt_handler();
        let started = Arc::new(AtomicUsize::new(0));

        let report = controller
            .run(vec![
                spider("one", 8, started.clone()),
                spider("two", 8, started.clone()),
                spider("three", 8, started.clone()),
            ])
            .await
            .unwrap();

        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert!(downloader.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(report.pages.success, 24);
        assert_eq!(sink.len().await, 24);
    }

    #[tokio::test]
    async fn test_colliding_output_names_are_rejected() {
        let controller =
            CrawlerController::new(&config(2), Arc::new(EchoDownloader), Arc::new(MemorySink::new()))
                .without_interrupt_handler();
        let started = Arc::new(AtomicUsize::new(0));

        let error = controller
            .run(vec![
                spider("Books", 1, started.clone()),
                spider("books", 1, started.clone()),
            ])
            .await
            .unwrap_err();

        assert!(error.to_string().contains("same output 'books'"));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_before_run_skips_spiders() {
        let controller =
            CrawlerController::new(&config(1), Arc::new(EchoDownloader), Arc::new(MemorySink::new()))
                .without_interrupt_handler();
        let started = Arc::new(AtomicUsize::new(0));

        controller.stop();
        let report = controller
            .run(vec![
                spider("alpha", 1, started.clone()),
                spider("beta", 1, started.clone()),
            ])
            .await
            .unwrap();

        assert!(report.stopped);
        assert!(report.spiders.is_empty());
        assert_eq!(report.skipped, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_of_one_runs_every_spider() {
        let controller =
            CrawlerController::new(&config(1), Arc::new(EchoDownloader), Arc::new(MemorySink::new()))
                .without_interrupt_handler();
        let started = Arc::new(AtomicUsize::new(0));

        let report = controller
            .run(vec![
                spider("one", 2, started.clone()),
                spider("two", 2, started.clone()),
                spider("three", 2, started.clone()),
            ])
            .await
            .unwrap();

        assert_eq!(report.spiders.len(), 3);
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(report.pages.success, 6);
        assert_eq!(report.spiders[0].spider, "one");
        assert_eq!(report.spiders[2].spider, "three");
    }
}
