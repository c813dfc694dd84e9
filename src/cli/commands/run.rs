//! Harvest run command.

use std::sync::Arc;

use console::style;
use tokio::sync::mpsc;

use crate::browser::ChromeLauncher;
use crate::cli::helpers::open_store;
use crate::cli::icons;
use crate::cli::progress::RunProgress;
use crate::config::HarvestConfig;
use crate::model::Outcome;
use crate::orchestrator::{Orchestrator, RunEvent, RunSummary};
use crate::session::BrowserLauncher;
use crate::source::Traversal;

pub struct RunOptions {
    pub traversal: Option<Traversal>,
    pub limit: Option<usize>,
    pub dry_run: bool,
    pub force: bool,
}

/// Apply command-line flags on top of the loaded configuration.
fn apply_options(config: &mut HarvestConfig, options: &RunOptions) {
    if let Some(traversal) = options.traversal {
        config.source.traversal = traversal;
    }
    if options.limit.is_some() {
        config.run.limit = options.limit;
    }
    if options.force {
        config.run.force = true;
    }
}

pub async fn cmd_run(mut config: HarvestConfig, options: RunOptions) -> anyhow::Result<()> {
    apply_options(&mut config, &options);

    let store = open_store(&config, options.dry_run)?;
    let launcher: Arc<dyn BrowserLauncher> = Arc::new(ChromeLauncher::new(&config.session));

    println!(
        "{} Harvesting sheet '{}' ({}, concurrency {}{})",
        icons::info(),
        config.source.layout.sheet,
        config.source.traversal,
        config.run.concurrency,
        if options.dry_run { ", dry run" } else { "" }
    );

    // Event channel for progress updates
    let (event_tx, mut event_rx) = mpsc::channel::<RunEvent>(100);
    let event_handler = tokio::spawn(async move {
        let mut progress = RunProgress::new();
        while let Some(event) = event_rx.recv().await {
            progress.handle(event);
        }
        progress.finish();
    });

    // The orchestrator owns the sender; dropping it ends the event handler.
    let result = Orchestrator::from_config(&config, store, launcher)
        .with_events(event_tx)
        .run()
        .await;

    if let Err(e) = event_handler.await {
        tracing::warn!("Event handler task failed: {}", e);
    }

    let summary = result?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} Processed {} items in {} batches ({:.0}s)",
        icons::success(),
        summary.items(),
        summary.batches,
        summary.elapsed_secs
    );

    for outcome in [
        Outcome::Resolved,
        Outcome::Partial,
        Outcome::NotFound,
        Outcome::Blocked,
        Outcome::Error,
    ] {
        let count = summary.count(outcome);
        if count > 0 {
            println!("  {} {}: {}", icons::outcome(outcome), outcome, count);
        }
    }
    if summary.reused > 0 {
        println!(
            "  {} answered from an earlier visit: {}",
            icons::dim_arrow(),
            summary.reused
        );
    }

    let rotations: u32 = summary.rotations.values().sum();
    if rotations > 0 {
        let detail = summary
            .rotations
            .iter()
            .map(|(reason, n)| format!("{} {}", n, reason.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "  {} sessions rotated: {} ({})",
            icons::dim_arrow(),
            rotations,
            detail
        );
    }

    if summary.stopped_by_budget {
        println!("  {} stopped by time budget", icons::warn());
    }

    if summary.write_failed > 0 {
        println!(
            "{} {} rows could not be written:",
            icons::error(),
            summary.write_failed
        );
        for key in &summary.failed_keys {
            println!("    {}", style(key).red());
        }
    }
    if !summary.errored_keys.is_empty() {
        println!(
            "{} {} rows failed to load:",
            icons::warn(),
            summary.errored_keys.len()
        );
        for key in &summary.errored_keys {
            println!("    {}", style(key).yellow());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let mut config = HarvestConfig::default();
        config.run.limit = Some(100);
        apply_options(
            &mut config,
            &RunOptions {
                traversal: Some(Traversal::Streaming),
                limit: None,
                dry_run: true,
                force: true,
            },
        );
        assert_eq!(config.source.traversal, Traversal::Streaming);
        assert_eq!(config.run.limit, Some(100));
        assert!(config.run.force);

        apply_options(
            &mut config,
            &RunOptions {
                traversal: None,
                limit: Some(5),
                dry_run: false,
                force: false,
            },
        );
        assert_eq!(config.run.limit, Some(5));
        assert!(config.run.force);
    }
}
