//! Shared helpers for CLI commands.

use std::sync::Arc;

use crate::config::HarvestConfig;
use crate::store::{DryRunStore, SheetsClient, TabularStore};

/// Open the configured Sheets store; with `dry_run` its writes stay in memory.
pub fn open_store(config: &HarvestConfig, dry_run: bool) -> anyhow::Result<Arc<dyn TabularStore>> {
    let Some((spreadsheet_id, token)) = config.sheets_credentials() else {
        anyhow::bail!(
            "No store configured. Set store.spreadsheet_id and SHEETS_ACCESS_TOKEN \
             (or store.access_token)."
        );
    };

    let mut client = SheetsClient::new(spreadsheet_id, token, config.store.timeout())?;
    if let Some(base_url) = &config.store.base_url {
        client = client.with_base_url(base_url.clone());
    }
    let client: Arc<dyn TabularStore> = Arc::new(client);

    if dry_run {
        Ok(Arc::new(DryRunStore::new(client)))
    } else {
        Ok(client)
    }
}
