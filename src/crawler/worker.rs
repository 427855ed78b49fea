use anyhow::{Context as _, Result};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cli::config::CrawlerSettings;
use crate::crawler::limiter::Slot;
use crate::crawler::request::Request;
use crate::crawler::scheduler::{Dispatch, Scheduler};
use crate::crawler::spider::{Context, Spider};
use crate::crawler::task::{Processed, TaskError, TaskOutcome};
use crate::downloader::Downloader;
use crate::pipeline::{DataCell, DrainReport, Pipeline};
use crate::utils::PageCounters;

/// Lifecycle of a [`Crawler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum CrawlerState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl CrawlerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CrawlerState::Idle,
            1 => CrawlerState::Running,
            2 => CrawlerState::Draining,
            _ => CrawlerState::Stopped,
        }
    }
}

/// What one crawler did during its run
#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub spider: String,
    pub seeded: usize,
    pub dequeued: usize,
    /// The loop ended because of a global stop rather than exhausted work
    pub stopped: bool,
    /// Queued requests discarded when the spider was deregistered
    pub discarded: usize,
    pub output: DrainReport,
}

/// State shared between the crawl loop and its processing tasks
struct Shared {
    spider: Spider,
    scheduler: Arc<Scheduler>,
    downloader: Arc<dyn Downloader>,
    pipeline: Arc<dyn Pipeline>,
    counters: Arc<PageCounters>,
}

/// Releases the slot and the in-flight count of one task on every exit path
struct TaskGuard {
    in_flight: Arc<AtomicI32>,
    _slot: Slot,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Worker loop bound to one spider.
///
/// Pulls requests for its spider from the shared [`Scheduler`] and processes each
/// one in its own task. The crawler only stops once it has no task in flight and
/// its spider's queue is empty, or when a global stop is requested.
pub struct Crawler {
    shared: Arc<Shared>,
    in_flight: Arc<AtomicI32>,
    state: AtomicU8,
    idle_backoff: Duration,
    drain_notice: Duration,
}

impl Crawler {
    pub fn new(
        spider: Spider,
        scheduler: Arc<Scheduler>,
        downloader: Arc<dyn Downloader>,
        pipeline: Arc<dyn Pipeline>,
        counters: Arc<PageCounters>,
    ) -> Self {
        let defaults = CrawlerSettings::default();
        Self {
            shared: Arc::new(Shared {
                spider,
                scheduler,
                downloader,
                pipeline,
                counters,
            }),
            in_flight: Arc::new(AtomicI32::new(0)),
            state: AtomicU8::new(CrawlerState::Idle as u8),
            idle_backoff: Duration::from_millis(defaults.idle_backoff_ms),
            drain_notice: Duration::from_millis(defaults.drain_notice_ms),
        }
    }

    /// Apply loop timings from configuration
    pub fn with_settings(mut self, settings: &CrawlerSettings) -> Self {
        self.idle_backoff = Duration::from_millis(settings.idle_backoff_ms);
        self.drain_notice = Duration::from_millis(settings.drain_notice_ms);
        self
    }

    pub fn spider(&self) -> &Spider {
        &self.shared.spider
    }

    pub fn state(&self) -> CrawlerState {
        CrawlerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Requests dispatched by this crawler that have not finished yet
    pub fn in_flight(&self) -> i32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// True when this crawler has no outstanding work left, or a global stop was requested
    pub fn can_stop(&self) -> bool {
        let scheduler = &self.shared.scheduler;
        // In-flight is read first: a finishing task queues its follow-ups before it decrements
        (self.in_flight() == 0 && scheduler.is_empty(self.shared.spider.id())) || scheduler.is_stop()
    }

    fn set_state(&self, state: CrawlerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Run the spider to completion and drain its pipeline
    pub async fn start(&self) -> Result<CrawlSummary> {
        if self
            .state
            .compare_exchange(
                CrawlerState::Idle as u8,
                CrawlerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            anyhow::bail!("Crawler for {} has already been started", self.spider().name());
        }

        let spider = &self.shared.spider;
        let scheduler = &self.shared.scheduler;
        scheduler.register_spider(spider.id(), spider.name(), spider.limit());

        if let Err(e) = self.shared.pipeline.start().await {
            scheduler.cancel_spider(spider.id());
            self.set_state(CrawlerState::Stopped);
            return Err(e).context(format!("Failed to start output pipeline for {}", spider.name()));
        }

        let seeded = match spider.start(scheduler) {
            Ok(seeded) => seeded,
            Err(e) => {
                error!("Start hook of {} failed: {:#}", spider.name(), e);
                0
            }
        };
        info!("Spider {} started with {} seed requests", spider.name(), seeded);

        let dequeued = self.run_loop().await;

        self.set_state(CrawlerState::Draining);
        let stopped = scheduler.is_stop();
        if stopped {
            self.wait_in_flight().await;
        }

        let output = match self.shared.pipeline.drain().await {
            Ok(report) => report,
            Err(e) => {
                error!("Failed to drain output of {}: {}", spider.name(), e);
                DrainReport::default()
            }
        };
        let discarded = scheduler.cancel_spider(spider.id());
        self.set_state(CrawlerState::Stopped);

        info!(
            "Spider {} finished: {} requests dequeued, {} discarded",
            spider.name(),
            dequeued,
            discarded
        );

        Ok(CrawlSummary {
            spider: spider.name().to_string(),
            seeded,
            dequeued,
            stopped,
            discarded,
            output,
        })
    }

    async fn run_loop(&self) -> usize {
        let spider = &self.shared.spider;
        let mut dequeued = 0;

        loop {
            tokio::time::sleep(spider.pausetime().sample()).await;

            match self.shared.scheduler.use_one(spider.id()) {
                Some(dispatch) => {
                    dequeued += 1;
                    self.dispatch(dispatch);
                }
                None if self.can_stop() => break,
                None => tokio::time::sleep(self.idle_backoff).await,
            }
        }

        dequeued
    }

    fn dispatch(&self, dispatch: Dispatch) {
        let (request, slot) = dispatch.into_parts();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = TaskGuard {
            in_flight: Arc::clone(&self.in_flight),
            _slot: slot,
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let _guard = guard;
            shared.process(request).await;
        });
    }

    /// After a global stop, let running tasks finish before the pipeline is drained.
    ///
    /// Each task is bounded by the downloader's own timeout, so this only reports
    /// progress every `drain_notice` instead of giving up.
    async fn wait_in_flight(&self) {
        let poll = self.idle_backoff.max(Duration::from_millis(1));
        let mut waited = Duration::ZERO;
        let mut next_notice = self.drain_notice;

        while self.in_flight() > 0 {
            tokio::time::sleep(poll).await;
            waited += poll;
            if !self.drain_notice.is_zero() && waited >= next_notice {
                warn!(
                    "Still waiting for {} requests of {} after {:?}",
                    self.in_flight(),
                    self.spider().name(),
                    waited
                );
                next_notice += self.drain_notice;
            }
        }
    }
}

impl Shared {
    /// One processing task: the outcome is settled here and never escapes
    async fn process(&self, request: Request) {
        let fingerprint = request.fingerprint();
        let url = request.url.clone();

        let outcome = AssertUnwindSafe(self.execute(request))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));

        match outcome {
            Ok(processed) => {
                self.counters.page_success();
                info!(" *     Success: {}", processed.url);
                debug!(
                    "{} items and {} files collected from {}",
                    processed.items, processed.files, processed.url
                );
            }
            Err(e) => {
                self.scheduler.del_deduplication(&fingerprint);
                self.counters.page_fail();
                error!(" *     Fail [{}]: {}: {}", e.stage(), url, e);
            }
        }
    }

    async fn execute(&self, request: Request) -> TaskOutcome {
        let mut response = self.downloader.download(&self.spider, request).await;
        if let Some(cause) = response.error() {
            return Err(TaskError::Download(cause.to_string()));
        }

        let rule_name = response.rule_name().to_string();
        Context::new(&self.spider, &self.scheduler, &mut response).parse(&rule_name)?;

        let url = response.url().to_string();
        let parent_url = response.referer().unwrap_or_default().to_string();
        let mut processed = Processed {
            url: url.clone(),
            ..Processed::default()
        };

        // A page only counts as a success once all of its output was accepted
        for item in response.take_items() {
            let cell = DataCell::new(rule_name.as_str(), item, url.as_str(), parent_url.as_str());
            self.pipeline
                .collect_data(cell)
                .await
                .map_err(|e| TaskError::Output(e.to_string()))?;
            processed.items += 1;
        }

        for file in response.take_files() {
            let name = file.name.clone();
            self.pipeline
                .collect_file(&rule_name, file)
                .await
                .map_err(|e| TaskError::Output(format!("file {}: {}", name, e)))?;
            processed.files += 1;
        }

        Ok(processed)
    }
}
