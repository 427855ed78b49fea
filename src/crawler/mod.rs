pub mod controller;
pub mod dedup;
pub mod limiter;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod spider;
pub mod task;
pub mod worker;

// Re-export common types
pub use controller::{CrawlerController, RunReport};
pub use request::Request;
pub use response::{FileCell, Item, Response};
pub use scheduler::{Dispatch, Scheduler, SchedulerError};
pub use spider::{Context, Pausetime, Rule, Seeder, Spider, SpiderId, SpiderRegistry};
pub use task::{Processed, TaskError, TaskOutcome};
pub use worker::{CrawlSummary, Crawler, CrawlerState};
