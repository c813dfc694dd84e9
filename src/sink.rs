//! Result sink: idempotent, chunked writes back to the store.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::model::{ExtractionResult, Field, FieldValue, RowKey, WorkItem};
use crate::store::{CellUpdate, SheetLayout, StoreError, TabularStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Rows per store request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Retries of one chunk after a transient error.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_chunk_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl SinkConfig {
    pub fn backoff(&self, retry: u32) -> Duration {
        let ms = self.base_delay_ms as f64
            * self
                .backoff_multiplier
                .max(1.0)
                .powi(retry.saturating_sub(1) as i32);
        Duration::from_millis(ms.round() as u64)
    }
}

/// Run `op`, retrying transient store errors with exponential backoff.
pub async fn with_backoff<T, F, Fut>(config: &SinkConfig, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < config.max_retries => {
                retry += 1;
                let delay = config.backoff(retry);
                warn!("{} failed ({}), retry {} in {:?}", what, e, retry, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Field values for one row, keyed to that row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWriteRequest {
    pub key: RowKey,
    pub values: BTreeMap<Field, FieldValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub written: Vec<RowKey>,
    pub failed: Vec<RowKey>,
    pub cells: usize,
}

impl WriteReport {
    pub fn absorb(&mut self, other: WriteReport) {
        self.written.extend(other.written);
        self.failed.extend(other.failed);
        self.cells += other.cells;
    }
}

pub struct ResultSink {
    store: Arc<dyn TabularStore>,
    layout: SheetLayout,
    config: SinkConfig,
    force: bool,
    write_blocked: bool,
}

impl ResultSink {
    pub fn new(
        store: Arc<dyn TabularStore>,
        layout: SheetLayout,
        config: SinkConfig,
        force: bool,
        write_blocked: bool,
    ) -> Self {
        Self {
            store,
            layout,
            config,
            force,
            write_blocked,
        }
    }

    /// Build the write for one resolved item, applying the sentinel guard.
    ///
    /// A sentinel never replaces a stored real value unless forcing.
    /// `BLOCKED` is only written when configured to.
    pub fn request_for(&self, item: &WorkItem, result: &ExtractionResult) -> Option<BatchWriteRequest> {
        let mut values = BTreeMap::new();
        for field in &item.fields_needed {
            if self.layout.column_for(*field).is_none() {
                continue;
            }
            let Some(value) = result.get(*field) else {
                continue;
            };
            if matches!(value, FieldValue::Blocked) && !self.write_blocked {
                continue;
            }
            let guarded = value.is_sentinel()
                && item.existing.get(field).is_some_and(|v| !v.is_sentinel());
            if guarded && !self.force {
                debug!("{}: keeping stored {} over {}", item.key, field, value);
                continue;
            }
            values.insert(*field, value.clone());
        }

        if values.is_empty() {
            None
        } else {
            Some(BatchWriteRequest {
                key: item.key.clone(),
                values,
            })
        }
    }

    fn cells(&self, request: &BatchWriteRequest) -> Vec<CellUpdate> {
        request
            .values
            .iter()
            .filter_map(|(field, value)| {
                Some(CellUpdate {
                    key: request.key.clone(),
                    column: self.layout.column_for(*field)?.to_string(),
                    value: value.as_store_str().to_string(),
                })
            })
            .collect()
    }

    /// Flush `batch` in bounded chunks. Rows of a chunk that exhausts its
    /// retries are reported as failed; later chunks still go out.
    pub async fn write(&self, batch: &[BatchWriteRequest]) -> WriteReport {
        let mut report = WriteReport::default();
        for chunk in batch.chunks(self.config.chunk_size.max(1)) {
            let updates: Vec<CellUpdate> = chunk.iter().flat_map(|r| self.cells(r)).collect();
            let keys: Vec<RowKey> = chunk.iter().map(|r| r.key.clone()).collect();
            if updates.is_empty() {
                continue;
            }

            let what = format!("write of {} rows", keys.len());
            match with_backoff(&self.config, &what, || self.store.update_cells(&updates)).await {
                Ok(()) => {
                    debug!("Wrote {} cells for {} rows", updates.len(), keys.len());
                    report.cells += updates.len();
                    report.written.extend(keys);
                }
                Err(e) => {
                    let listed: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
                    error!("Failed to write rows {}: {}", listed.join(", "), e);
                    report.failed.extend(keys);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::BTreeSet;

    fn fields(list: &[Field]) -> BTreeSet<Field> {
        list.iter().copied().collect()
    }

    fn sink(store: Arc<MemoryStore>, chunk_size: usize) -> ResultSink {
        ResultSink::new(
            store,
            SheetLayout::new("Ads"),
            SinkConfig {
                chunk_size,
                max_retries: 3,
                base_delay_ms: 100,
                backoff_multiplier: 2.0,
            },
            false,
            false,
        )
    }

    fn request(row: u32, link: &str) -> BatchWriteRequest {
        BatchWriteRequest {
            key: RowKey::new("Ads", row),
            values: [
                (Field::StoreLink, FieldValue::Value(link.to_string())),
                (Field::AppName, FieldValue::NotFound),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_without_duplicates() {
        let store = Arc::new(MemoryStore::new());
        store.fail_row(
            RowKey::new("Ads", 3),
            1,
            StoreError::Http {
                status: 429,
                message: "RESOURCE_EXHAUSTED".into(),
            },
        );
        let sink = sink(store.clone(), 2);
        let batch: Vec<BatchWriteRequest> = (1..=5)
            .map(|row| request(row, &format!("https://play.google.com/store/apps/details?id=com.app.n{}", row)))
            .collect();

        let report = sink.write(&batch).await;

        assert_eq!(report.written.len(), 5);
        assert!(report.failed.is_empty());
        assert_eq!(report.cells, 10);
        // Three chunks plus one retry; the failed attempt wrote nothing.
        assert_eq!(store.update_calls(), 4);
        assert_eq!(store.cells_written(), 10);
        for row in 1..=5 {
            assert_eq!(
                store.cell("Ads", row, "C"),
                format!("https://play.google.com/store/apps/details?id=com.app.n{}", row)
            );
            assert_eq!(store.cell("Ads", row, "D"), "NOT_FOUND");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_chunk_reports_failed_rows_and_continues() {
        let store = Arc::new(MemoryStore::new());
        store.fail_row(RowKey::new("Ads", 1), 10, StoreError::Transient("unavailable".into()));
        let sink = sink(store.clone(), 1);

        let report = sink.write(&[request(1, "a"), request(2, "b")]).await;

        assert_eq!(report.failed, vec![RowKey::new("Ads", 1)]);
        assert_eq!(report.written, vec![RowKey::new("Ads", 2)]);
        // One try plus three retries for row 1, one write for row 2.
        assert_eq!(store.update_calls(), 5);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_row(
            RowKey::new("Ads", 1),
            1,
            StoreError::Http {
                status: 403,
                message: "forbidden".into(),
            },
        );
        let sink = sink(store.clone(), 10);

        let report = sink.write(&[request(1, "a")]).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(store.update_calls(), 1);
    }

    #[tokio::test]
    async fn writing_twice_leaves_the_same_state() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink(store.clone(), 10);
        let batch = vec![request(4, "https://apps.apple.com/app/id123456")];

        sink.write(&batch).await;
        let once = store.rows("Ads");
        sink.write(&batch).await;

        assert_eq!(store.rows("Ads"), once);
    }

    #[test]
    fn sentinel_never_overwrites_stored_value() {
        let store = Arc::new(MemoryStore::new());
        let sink = sink(store, 10);
        let mut item = WorkItem::new(
            RowKey::new("Ads", 9),
            "https://ad/9",
            fields(&[Field::StoreLink, Field::AppName]),
        );
        item.existing
            .insert(Field::AppName, FieldValue::Value("Kept Name".into()));

        let mut result = ExtractionResult::new();
        result.set(Field::StoreLink, FieldValue::Value("https://play.google.com/store/apps/details?id=a.b.c".into()), true, "anchor");
        result.set(Field::AppName, FieldValue::NotFound, false, "heading");

        let request = sink.request_for(&item, &result).unwrap();
        assert!(request.values.contains_key(&Field::StoreLink));
        assert!(!request.values.contains_key(&Field::AppName));
    }

    #[test]
    fn blocked_is_skipped_unless_configured() {
        let store = Arc::new(MemoryStore::new());
        let item = WorkItem::new(RowKey::new("Ads", 2), "https://ad/2", fields(&[Field::StoreLink]));
        let result = ExtractionResult::blocked(&item.fields_needed);

        let quiet = sink(store.clone(), 10);
        assert!(quiet.request_for(&item, &result).is_none());

        let loud = ResultSink::new(store, SheetLayout::new("Ads"), SinkConfig::default(), false, true);
        let request = loud.request_for(&item, &result).unwrap();
        assert_eq!(request.values.get(&Field::StoreLink), Some(&FieldValue::Blocked));
    }
}
