pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::EngineConfig;
use crate::storage::SinkKind;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run configured spiders until their queues drain
    Crawl {
        /// Spider to run; repeat for several (default: all)
        #[arg(short, long = "spider")]
        spiders: Vec<String>,

        /// Concurrent requests across all spiders
        #[arg(long)]
        slots: Option<usize>,

        /// Output backend
        #[arg(short, long, value_enum)]
        out_type: Option<SinkKind>,
    },

    /// List configured spiders
    Spiders,

    /// Show the effective configuration
    Config {
        /// Write a default configuration file instead
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    if let Commands::Config { init: true } = cli.command {
        return commands::init_config(cli.config.as_deref());
    }

    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Crawl {
            spiders,
            slots,
            out_type,
        } => {
            info!("Starting crawl");
            commands::crawl(config, spiders, slots, out_type).await
        }
        Commands::Spiders => commands::list_spiders(&config),
        Commands::Config { .. } => commands::show_config(&config),
    }
}
