//! Multi-spider crawling engine.
//!
//! Spiders push requests into one shared [`crawler::Scheduler`]; one
//! [`crawler::Crawler`] per spider pulls them, downloads and parses each page in
//! its own task, and hands extracted items and files to an output
//! [`pipeline::Pipeline`] backed by a [`storage::DataSink`].

pub mod cli;
pub mod crawler;
pub mod downloader;
pub mod pipeline;
pub mod spiders;
pub mod storage;
pub mod utils;
