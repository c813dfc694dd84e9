//! Configuration check command.

use console::style;

use crate::cli::icons;
use crate::config::HarvestConfig;

/// Print the resolved configuration. Loading already validated it.
pub fn cmd_check_config(config: &HarvestConfig) -> anyhow::Result<()> {
    let source = config
        .source_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults (no config file found)".to_string());

    eprintln!("{} Configuration is valid", icons::success());
    eprintln!("  {} Source: {}", icons::dim_arrow(), source);
    match config.sheets_credentials() {
        Some((id, _)) => eprintln!("  {} Spreadsheet: {}", icons::dim_arrow(), id),
        None => eprintln!(
            "  {} No Sheets credentials; only check-config will work",
            style("!").yellow()
        ),
    }
    #[cfg(not(feature = "browser"))]
    eprintln!(
        "  {} Built without browser support; runs will fail to launch sessions",
        icons::warn()
    );

    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
