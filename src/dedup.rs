//! Destination dedup and multi-source consolidation.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::extract::normalize::canonical_store_link;
use crate::model::FieldValue;
use crate::sink::{with_backoff, SinkConfig};
use crate::store::{column_index, column_letter, RowSpan, SheetLayout, StoreError, TabularStore};

/// Normalized dedup key for a destination, or `None` when there is nothing
/// to key on (empty cell or sentinel).
pub fn normalize_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if FieldValue::from_store_str(trimmed).map_or(true, |v| v.is_sentinel()) {
        return None;
    }
    if let Some(link) = canonical_store_link(trimmed) {
        return Some(link.to_lowercase());
    }

    let lower = trimmed.to_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    let key = without_www.trim_end_matches('/');
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

/// Keys accepted so far. Only ever grows.
#[derive(Debug, Clone, Default)]
pub struct DedupSet {
    keys: HashSet<String>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record existing keys; returns how many were new.
    pub fn preload<'a>(&mut self, raw: impl IntoIterator<Item = &'a str>) -> usize {
        raw.into_iter()
            .filter_map(normalize_key)
            .filter(|k| self.keys.insert(k.clone()))
            .count()
    }

    /// True when `raw` is novel (and records it); false for duplicates and
    /// values with no usable key.
    pub fn accept(&mut self, raw: &str) -> bool {
        match normalize_key(raw) {
            Some(key) => self.keys.insert(key),
            None => false,
        }
    }

    pub fn contains(&self, raw: &str) -> bool {
        normalize_key(raw).is_some_and(|k| self.keys.contains(&k))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Sheets whose rows are consolidated, in priority order.
    #[serde(default)]
    pub sources: Vec<SheetLayout>,
    #[serde(default)]
    pub destination: Option<SheetLayout>,
    /// Rows per append request.
    #[serde(default = "default_append_chunk")]
    pub append_chunk: usize,
}

fn default_append_chunk() -> usize {
    200
}

/// Column a layout is deduplicated on: the destination link, or the page URL
/// when the sheet has no link column.
pub fn key_column(layout: &SheetLayout) -> &str {
    layout.link_column.as_deref().unwrap_or(&layout.url_column)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub read: usize,
    pub appended: usize,
    pub duplicates: usize,
    pub without_key: usize,
}

/// Reads several source sheets and appends their novel rows to one destination.
pub struct Consolidator {
    store: Arc<dyn TabularStore>,
    config: MergeConfig,
    sink: SinkConfig,
}

impl Consolidator {
    pub fn new(store: Arc<dyn TabularStore>, config: MergeConfig, sink: SinkConfig) -> Self {
        Self {
            store,
            config,
            sink,
        }
    }

    async fn read_all(&self, layout: &SheetLayout) -> Result<Vec<Vec<String>>, StoreError> {
        let last_col = column_letter(layout.column_bounds().map(|(_, last)| last).unwrap_or(0));
        let rows = with_backoff(&self.sink, &format!("read of {}", layout.sheet), || {
            self.store.read_rows(
                &layout.sheet,
                "A",
                &last_col,
                RowSpan::new(layout.first_data_row(), None),
            )
        })
        .await?;
        Ok(rows)
    }

    fn key_of<'a>(layout: &SheetLayout, row: &'a [String]) -> &'a str {
        column_index(key_column(layout))
            .and_then(|idx| row.get(idx as usize))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub async fn run(&self, dry_run: bool) -> Result<MergeReport, StoreError> {
        let Some(destination) = &self.config.destination else {
            return Err(StoreError::Fatal("merge destination is not configured".into()));
        };

        let mut seen = DedupSet::new();
        let existing = self.read_all(destination).await?;
        let preloaded = seen.preload(existing.iter().map(|row| Self::key_of(destination, row)));
        info!(
            "Preloaded {} destination keys from {}",
            preloaded, destination.sheet
        );

        let mut report = MergeReport::default();
        let mut novel: Vec<Vec<String>> = Vec::new();
        for source in &self.config.sources {
            let rows = self.read_all(source).await?;
            let before = novel.len();
            for row in rows {
                report.read += 1;
                let key = Self::key_of(source, &row);
                if normalize_key(key).is_none() {
                    report.without_key += 1;
                    continue;
                }
                if seen.accept(key) {
                    novel.push(row);
                } else {
                    debug!("Duplicate destination {} in {}", key, source.sheet);
                    report.duplicates += 1;
                }
            }
            info!("{}: {} novel rows", source.sheet, novel.len() - before);
        }

        if dry_run {
            info!("Dry run: would append {} rows to {}", novel.len(), destination.sheet);
            report.appended = novel.len();
            return Ok(report);
        }

        for chunk in novel.chunks(self.config.append_chunk.max(1)) {
            with_backoff(&self.sink, &format!("append to {}", destination.sheet), || {
                self.store.append_rows(&destination.sheet, chunk)
            })
            .await?;
            report.appended += chunk.len();
        }

        info!(
            "Merged {} rows into {} ({} duplicates, {} without key)",
            report.appended, destination.sheet, report.duplicates, report.without_key
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn keys_ignore_case_whitespace_and_scheme() {
        assert_eq!(
            normalize_key("  https://Example.com/App/ "),
            normalize_key("http://www.example.com/app")
        );
        assert_eq!(
            normalize_key("https://play.google.com/store/apps/details?id=Com.Foo.Bar&hl=en"),
            Some("https://play.google.com/store/apps/details?id=com.foo.bar".into())
        );
        assert_eq!(normalize_key("NOT_FOUND"), None);
        assert_eq!(normalize_key("   "), None);
    }

    #[test]
    fn same_destination_from_two_sources_is_accepted_once() {
        let mut set = DedupSet::new();
        assert!(set.accept("https://play.google.com/store/apps/details?id=com.example.app"));
        assert!(!set.accept("  HTTPS://PLAY.GOOGLE.COM/store/apps/details?id=com.example.app  "));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn preloaded_keys_reject_new_items() {
        let mut set = DedupSet::new();
        assert_eq!(set.preload(["https://apps.apple.com/us/app/foo/id1234567", "", "ERROR"]), 1);
        assert!(set.contains("https://apps.apple.com/app/id1234567"));
        assert!(!set.accept("https://apps.apple.com/gb/app/foo-app/id1234567?mt=8"));
    }

    fn layout(sheet: &str) -> SheetLayout {
        SheetLayout {
            tagline_column: None,
            ..SheetLayout::new(sheet)
        }
    }

    #[tokio::test]
    async fn consolidation_appends_only_novel_rows() {
        let store = Arc::new(
            MemoryStore::new()
                .with_sheet(
                    "Merged",
                    vec![
                        vec!["advertiser", "url", "link", "label"],
                        vec!["Old", "https://ad/0", "https://play.google.com/store/apps/details?id=com.old.app", "Old"],
                    ],
                )
                .with_sheet(
                    "US",
                    vec![
                        vec!["advertiser", "url", "link", "label"],
                        vec!["A", "https://ad/1", "https://play.google.com/store/apps/details?id=com.example.app", "Ex"],
                        vec!["B", "https://ad/2", "https://play.google.com/store/apps/details?id=com.old.app", "Old"],
                        vec!["C", "https://ad/3", "NOT_FOUND", ""],
                    ],
                )
                .with_sheet(
                    "EU",
                    vec![
                        vec!["advertiser", "url", "link", "label"],
                        vec!["A2", "https://ad/9", " https://PLAY.google.com/store/apps/details?id=com.example.app ", "Ex"],
                        vec!["D", "https://ad/4", "https://apps.apple.com/app/id998877", "Dee"],
                    ],
                ),
        );
        let consolidator = Consolidator::new(
            store.clone(),
            MergeConfig {
                sources: vec![layout("US"), layout("EU")],
                destination: Some(layout("Merged")),
                append_chunk: 1,
            },
            SinkConfig::default(),
        );

        let report = consolidator.run(false).await.unwrap();

        assert_eq!(
            report,
            MergeReport {
                read: 5,
                appended: 2,
                duplicates: 2,
                without_key: 1,
            }
        );
        let merged = store.rows("Merged");
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[2][0], "A");
        assert_eq!(merged[3][0], "D");
    }

    #[tokio::test]
    async fn dry_run_appends_nothing() {
        let store = Arc::new(
            MemoryStore::new()
                .with_sheet("Merged", vec![vec!["advertiser", "url", "link", "label"]])
                .with_sheet(
                    "US",
                    vec![
                        vec!["advertiser", "url", "link", "label"],
                        vec!["A", "https://ad/1", "https://play.google.com/store/apps/details?id=com.example.app", "Ex"],
                    ],
                ),
        );
        let consolidator = Consolidator::new(
            store.clone(),
            MergeConfig {
                sources: vec![layout("US")],
                destination: Some(layout("Merged")),
                append_chunk: 10,
            },
            SinkConfig::default(),
        );

        let report = consolidator.run(true).await.unwrap();
        assert_eq!(report.appended, 1);
        assert_eq!(store.rows("Merged").len(), 1);
    }
}
