//! In-memory store used for dry runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use super::{column_index, CellUpdate, RowSpan, StoreError, TabularStore};
use crate::model::RowKey;

type Grid = Vec<Vec<String>>;

/// Sheets held as grids of strings, column A first, row 1 first.
#[derive(Default)]
pub struct MemoryStore {
    sheets: Mutex<BTreeMap<String, Grid>>,
    /// Injected failures: remaining count and error per row.
    row_faults: Mutex<HashMap<RowKey, (u32, StoreError)>>,
    read_faults: Mutex<Option<(u32, StoreError)>>,
    update_calls: AtomicU32,
    cells_written: AtomicU32,
    /// Log writes instead of staying silent (dry runs).
    verbose: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that logs every write it receives.
    pub fn dry_run() -> Self {
        Self {
            verbose: true,
            ..Self::default()
        }
    }

    pub fn with_sheet(self, sheet: &str, rows: Vec<Vec<&str>>) -> Self {
        self.insert_sheet(sheet, rows);
        self
    }

    pub fn insert_sheet(&self, sheet: &str, rows: Vec<Vec<&str>>) {
        let grid = rows
            .into_iter()
            .map(|r| r.into_iter().map(str::to_string).collect())
            .collect();
        if let Ok(mut sheets) = self.sheets.lock() {
            sheets.insert(sheet.to_string(), grid);
        }
    }

    /// Fail the next `times` update requests touching `key` with `error`.
    pub fn fail_row(&self, key: RowKey, times: u32, error: StoreError) {
        if let Ok(mut faults) = self.row_faults.lock() {
            faults.insert(key, (times, error));
        }
    }

    /// Fail the next `times` reads with `error`.
    pub fn fail_reads(&self, times: u32, error: StoreError) {
        if let Ok(mut faults) = self.read_faults.lock() {
            *faults = Some((times, error));
        }
    }

    pub fn cell(&self, sheet: &str, row: u32, column: &str) -> String {
        let Some(col) = column_index(column) else {
            return String::new();
        };
        self.sheets
            .lock()
            .ok()
            .and_then(|sheets| {
                sheets
                    .get(sheet)?
                    .get(row.checked_sub(1)? as usize)?
                    .get(col as usize)
                    .cloned()
            })
            .unwrap_or_default()
    }

    pub fn rows(&self, sheet: &str) -> Grid {
        self.sheets
            .lock()
            .ok()
            .and_then(|sheets| sheets.get(sheet).cloned())
            .unwrap_or_default()
    }

    pub fn update_calls(&self) -> u32 {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn cells_written(&self) -> u32 {
        self.cells_written.load(Ordering::SeqCst)
    }

    fn lock_error() -> StoreError {
        StoreError::Fatal("memory store lock poisoned".to_string())
    }

    fn take_read_fault(&self) -> Result<(), StoreError> {
        let mut faults = self.read_faults.lock().map_err(|_| Self::lock_error())?;
        if let Some((remaining, error)) = faults.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TabularStore for MemoryStore {
    async fn read_rows(
        &self,
        sheet: &str,
        first_col: &str,
        last_col: &str,
        rows: RowSpan,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        self.take_read_fault()?;
        let (Some(first), Some(last)) = (column_index(first_col), column_index(last_col)) else {
            return Err(StoreError::Fatal(format!(
                "invalid column range {}:{}",
                first_col, last_col
            )));
        };
        let width = (last - first + 1) as usize;

        let sheets = self.sheets.lock().map_err(|_| Self::lock_error())?;
        let grid = sheets
            .get(sheet)
            .ok_or_else(|| StoreError::Http {
                status: 400,
                message: format!("Unable to parse range: {}", sheet),
            })?;

        let start = rows.first.saturating_sub(1) as usize;
        let end = rows
            .last
            .map(|l| (l as usize).min(grid.len()))
            .unwrap_or(grid.len());
        let mut out: Grid = grid
            .iter()
            .take(end)
            .skip(start)
            .map(|row| {
                (0..width)
                    .map(|i| row.get(first as usize + i).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();
        while out
            .last()
            .is_some_and(|row: &Vec<String>| row.iter().all(|c| c.is_empty()))
        {
            out.pop();
        }
        Ok(out)
    }

    async fn last_row(&self, sheet: &str, column: &str) -> Result<u32, StoreError> {
        self.take_read_fault()?;
        let col = column_index(column)
            .ok_or_else(|| StoreError::Fatal(format!("invalid column {}", column)))?;
        let sheets = self.sheets.lock().map_err(|_| Self::lock_error())?;
        let last = sheets
            .get(sheet)
            .and_then(|grid| {
                grid.iter()
                    .rposition(|row| row.get(col as usize).is_some_and(|c| !c.is_empty()))
            })
            .map(|idx| idx as u32 + 1)
            .unwrap_or(0);
        Ok(last)
    }

    async fn update_cells(&self, updates: &[CellUpdate]) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut faults = self.row_faults.lock().map_err(|_| Self::lock_error())?;
            for update in updates {
                if let Some((remaining, error)) = faults.get_mut(&update.key) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(error.clone());
                    }
                }
            }
        }

        let mut sheets = self.sheets.lock().map_err(|_| Self::lock_error())?;
        for update in updates {
            let col = column_index(&update.column)
                .ok_or_else(|| StoreError::Fatal(format!("invalid column {}", update.column)))?
                as usize;
            let grid = sheets.entry(update.key.sheet.clone()).or_default();
            let row_idx = update.key.row.saturating_sub(1) as usize;
            if grid.len() <= row_idx {
                grid.resize(row_idx + 1, Vec::new());
            }
            let row = &mut grid[row_idx];
            if row.len() <= col {
                row.resize(col + 1, String::new());
            }
            if self.verbose {
                info!("[dry run] {}{} = {:?}", update.key, update.column, update.value);
            }
            row[col] = update.value.clone();
            self.cells_written.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn append_rows(&self, sheet: &str, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut sheets = self.sheets.lock().map_err(|_| Self::lock_error())?;
        let grid = sheets.entry(sheet.to_string()).or_default();
        while grid
            .last()
            .is_some_and(|row: &Vec<String>| row.iter().all(|c| c.is_empty()))
        {
            grid.pop();
        }
        for row in rows {
            if self.verbose {
                info!("[dry run] append to {}: {:?}", sheet, row);
            }
            grid.push(row.clone());
        }
        Ok(())
    }
}

/// Reads from a real store; writes land in memory and are logged.
pub struct DryRunStore {
    inner: Arc<dyn TabularStore>,
    writes: MemoryStore,
}

impl DryRunStore {
    pub fn new(inner: Arc<dyn TabularStore>) -> Self {
        Self {
            inner,
            writes: MemoryStore::dry_run(),
        }
    }

    /// Everything that would have been written.
    pub fn writes(&self) -> &MemoryStore {
        &self.writes
    }
}

#[async_trait]
impl TabularStore for DryRunStore {
    async fn read_rows(
        &self,
        sheet: &str,
        first_col: &str,
        last_col: &str,
        rows: RowSpan,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        self.inner.read_rows(sheet, first_col, last_col, rows).await
    }

    async fn last_row(&self, sheet: &str, column: &str) -> Result<u32, StoreError> {
        self.inner.last_row(sheet, column).await
    }

    async fn update_cells(&self, updates: &[CellUpdate]) -> Result<(), StoreError> {
        self.writes.update_cells(updates).await
    }

    async fn append_rows(&self, sheet: &str, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.writes.append_rows(sheet, rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new().with_sheet(
            "Ads",
            vec![
                vec!["advertiser", "url", "link", "label"],
                vec!["Acme", "https://a", "", ""],
                vec!["Beta", "https://b", "https://play", "B"],
            ],
        )
    }

    #[tokio::test]
    async fn reads_are_padded_to_the_requested_width() {
        let rows = store()
            .read_rows("Ads", "B", "E", RowSpan::new(2, None))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["https://a", "", "", ""]);
        assert_eq!(rows[1][2], "B");
    }

    #[tokio::test]
    async fn updates_extend_the_grid() {
        let store = store();
        store
            .update_cells(&[CellUpdate {
                key: RowKey::new("Ads", 5),
                column: "E".into(),
                value: "tag".into(),
            }])
            .await
            .unwrap();
        assert_eq!(store.cell("Ads", 5, "E"), "tag");
        assert_eq!(store.last_row("Ads", "E").await.unwrap(), 5);
        assert_eq!(store.last_row("Ads", "B").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn injected_row_fault_fires_once() {
        let store = store();
        let key = RowKey::new("Ads", 2);
        store.fail_row(key.clone(), 1, StoreError::Transient("quota".into()));
        let update = CellUpdate {
            key,
            column: "C".into(),
            value: "x".into(),
        };
        assert!(store.update_cells(&[update.clone()]).await.is_err());
        assert_eq!(store.cell("Ads", 2, "C"), "");
        store.update_cells(&[update]).await.unwrap();
        assert_eq!(store.cell("Ads", 2, "C"), "x");
    }

    #[tokio::test]
    async fn dry_run_reads_through_and_keeps_writes_local() {
        let real = Arc::new(store());
        let dry = DryRunStore::new(real.clone());

        let rows = dry.read_rows("Ads", "A", "A", RowSpan::new(2, None)).await.unwrap();
        assert_eq!(rows, vec![vec!["Acme"], vec!["Beta"]]);

        dry.update_cells(&[CellUpdate {
            key: RowKey::new("Ads", 2),
            column: "C".into(),
            value: "https://play".into(),
        }])
        .await
        .unwrap();
        dry.append_rows("Merged", &[vec!["x".to_string()]]).await.unwrap();

        assert_eq!(real.cell("Ads", 2, "C"), "");
        assert_eq!(real.update_calls(), 0);
        assert_eq!(dry.writes().cell("Ads", 2, "C"), "https://play");
        assert_eq!(dry.writes().rows("Merged").len(), 1);
    }
}
