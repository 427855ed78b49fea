use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::cli::config::EngineConfig;
use crate::crawler::controller::{CrawlerController, RunReport};
use crate::spiders::registry_from_config;
use crate::storage::{SinkKind, SinkRegistry};

/// Apply command line overrides on top of the loaded configuration
pub fn apply_overrides(config: &mut EngineConfig, slots: Option<usize>, out_type: Option<SinkKind>) {
    if let Some(slots) = slots {
        config.crawler.slots = slots;
    }
    if let Some(out_type) = out_type {
        config.output.out_type = out_type;
    }
}

/// Run the selected spiders and print the run report
pub async fn crawl(
    mut config: EngineConfig,
    spiders: Vec<String>,
    slots: Option<usize>,
    out_type: Option<SinkKind>,
) -> Result<()> {
    apply_overrides(&mut config, slots, out_type);

    let registry = registry_from_config(&config.spiders, config.crawler.default_pause.into())
        .context("Invalid spider definition")?;
    if registry.is_empty() {
        anyhow::bail!("No spiders configured; add definitions under `spiders:` in the configuration file");
    }
    let selected = registry.select(&spiders)?;

    let controller = CrawlerController::from_config(&config, &SinkRegistry::with_defaults()).await?;
    let report = controller.run(selected).await?;

    print_report(&report);
    if report.stopped {
        warn!("Crawl was stopped before all queues drained");
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "Crawl {} finished in {:.1}s",
        report.run_id,
        report.pages.elapsed_ms as f64 / 1000.0
    );
    println!(
        "Pages: {} succeeded, {} failed ({:.1} pages/s)",
        report.pages.success,
        report.pages.fail,
        report.pages.rate()
    );

    for summary in &report.spiders {
        println!(
            "  - {}: {} dequeued, {} items, {} files, {} output failures{}",
            summary.spider,
            summary.dequeued,
            summary.output.data_written,
            summary.output.files_written,
            summary.output.failed,
            if summary.discarded > 0 {
                format!(", {} requests discarded", summary.discarded)
            } else {
                String::new()
            }
        );
    }
    for (spider, cause) in &report.errors {
        println!("  - {}: failed: {}", spider, cause);
    }
    for spider in &report.skipped {
        println!("  - {}: not started", spider);
    }
}

/// List configured spiders
pub fn list_spiders(config: &EngineConfig) -> Result<()> {
    let registry = registry_from_config(&config.spiders, config.crawler.default_pause.into())
        .context("Invalid spider definition")?;

    if registry.is_empty() {
        println!("No spiders configured");
        return Ok(());
    }

    println!("Configured spiders:");
    for spider in registry.all() {
        let rules: Vec<&str> = spider.rule_names().collect();
        println!("  - {} [{}] {}", spider.name(), rules.join(", "), spider.description());
    }
    Ok(())
}

/// Show the effective configuration
pub fn show_config(config: &EngineConfig) -> Result<()> {
    let contents = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    println!("{}", contents);
    Ok(())
}

/// Write a default configuration file
pub fn init_config(path: Option<&Path>) -> Result<()> {
    let config = EngineConfig::default();
    let written = match path {
        Some(path) => {
            config.save_to_file(path)?;
            path.to_path_buf()
        }
        None => config.save_as_default()?,
    };
    info!("Default configuration written to {}", written.display());
    println!("{}", written.display());
    Ok(())
}
