//! Sheet consolidation command.

use crate::cli::helpers::open_store;
use crate::cli::icons;
use crate::config::HarvestConfig;
use crate::dedup::Consolidator;

pub async fn cmd_merge(config: &HarvestConfig, dry_run: bool) -> anyhow::Result<()> {
    let Some(destination) = &config.merge.destination else {
        anyhow::bail!("No merge destination configured (merge.destination).");
    };
    if config.merge.sources.is_empty() {
        println!("{} No merge sources configured (merge.sources)", icons::warn());
        return Ok(());
    }

    println!(
        "{} Merging {} sheets into '{}'{}",
        icons::info(),
        config.merge.sources.len(),
        destination.sheet,
        if dry_run { " (dry run)" } else { "" }
    );

    let store = open_store(config, false)?;
    let report = Consolidator::new(store, config.merge.clone(), config.sink.clone())
        .run(dry_run)
        .await?;

    let verb = if dry_run { "Would append" } else { "Appended" };
    println!(
        "{} {} {} of {} rows",
        icons::success(),
        verb,
        report.appended,
        report.read
    );
    if report.duplicates > 0 {
        println!("  {} {} duplicates skipped", icons::dim_arrow(), report.duplicates);
    }
    if report.without_key > 0 {
        println!(
            "  {} {} rows without a destination link skipped",
            icons::dim_arrow(),
            report.without_key
        );
    }
    Ok(())
}
