//! CLI parser and dispatch to command modules.

mod config_cmd;
mod merge;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::HarvestConfig;
use crate::source::Traversal;

#[derive(Parser)]
#[command(name = "adharvest")]
#[command(about = "Harvest app-store destinations from ad detail pages")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true, env = "ADHARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

fn parse_traversal(s: &str) -> Result<Traversal, String> {
    Traversal::from_str(s)
        .ok_or_else(|| format!("unknown traversal '{}' (top-down, bottom-up, streaming)", s))
}

#[derive(Subcommand)]
enum Commands {
    /// Visit pending ad rows and write the extracted fields back
    Run {
        /// Order in which rows are visited
        #[arg(long, value_parser = parse_traversal)]
        traversal: Option<Traversal>,
        /// Stop after this many items
        #[arg(short, long)]
        limit: Option<usize>,
        /// Log writes instead of sending them to the store
        #[arg(long)]
        dry_run: bool,
        /// Reprocess rows that already have values
        #[arg(short, long)]
        force: bool,
    },

    /// Consolidate source sheets into the destination, skipping known links
    Merge {
        /// Report what would be appended without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate and print the resolved configuration
    CheckConfig,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = HarvestConfig::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run {
            traversal,
            limit,
            dry_run,
            force,
        } => {
            run::cmd_run(
                config,
                run::RunOptions {
                    traversal,
                    limit,
                    dry_run,
                    force,
                },
            )
            .await
        }
        Commands::Merge { dry_run } => merge::cmd_merge(&config, dry_run).await,
        Commands::CheckConfig => config_cmd::cmd_check_config(&config),
    }
}
