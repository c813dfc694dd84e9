//! Work source: batches of rows that still need extraction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Field, FieldValue, RowKey, WorkItem};
use crate::store::{column_letter, RowSpan, SheetLayout, StoreError, TabularStore};

/// Order in which the sheet is walked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Traversal {
    /// First data row to last, filling each batch.
    #[default]
    TopDown,
    /// Last data row to first, filling each batch.
    BottomUp,
    /// One read chunk per batch, following rows appended mid-run.
    Streaming,
}

impl Traversal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopDown => "top-down",
            Self::BottomUp => "bottom-up",
            Self::Streaming => "streaming",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "top-down" | "topdown" | "forward" => Some(Self::TopDown),
            "bottom-up" | "bottomup" | "reverse" => Some(Self::BottomUp),
            "streaming" | "stream" => Some(Self::Streaming),
            _ => None,
        }
    }
}

impl std::fmt::Display for Traversal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub layout: SheetLayout,
    #[serde(default)]
    pub traversal: Traversal,
    /// Items per batch handed to the orchestrator.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rows fetched per store read.
    #[serde(default = "default_read_chunk")]
    pub read_chunk: u32,
    /// Optional row bounds (1-based, inclusive).
    #[serde(default)]
    pub start_row: Option<u32>,
    #[serde(default)]
    pub end_row: Option<u32>,
}

fn default_batch_size() -> usize {
    25
}

fn default_read_chunk() -> u32 {
    200
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            layout: SheetLayout::default(),
            traversal: Traversal::default(),
            batch_size: default_batch_size(),
            read_chunk: default_read_chunk(),
            start_row: None,
            end_row: None,
        }
    }
}

/// Position in the sheet. `next` is the next row to read in traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub next: u32,
    pub first: u32,
    pub last: u32,
}

impl Cursor {
    fn is_past_end(&self, traversal: Traversal) -> bool {
        match traversal {
            Traversal::BottomUp => self.next < self.first || self.next == 0,
            _ => self.next > self.last,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub items: Vec<WorkItem>,
    pub next: Cursor,
    pub exhausted: bool,
}

pub struct WorkSource {
    store: Arc<dyn TabularStore>,
    config: SourceConfig,
    required: BTreeSet<Field>,
    force: bool,
}

impl WorkSource {
    pub fn new(
        store: Arc<dyn TabularStore>,
        config: SourceConfig,
        required: BTreeSet<Field>,
        force: bool,
    ) -> Self {
        Self {
            store,
            config,
            required,
            force,
        }
    }

    pub fn layout(&self) -> &SheetLayout {
        &self.config.layout
    }

    pub fn traversal(&self) -> Traversal {
        self.config.traversal
    }

    /// Output fields whose joint emptiness marks a row as needing work.
    pub fn gating_fields(&self) -> BTreeSet<Field> {
        let outputs = self.config.layout.output_fields();
        let required: BTreeSet<Field> = self.required.intersection(&outputs).copied().collect();
        if required.is_empty() {
            outputs
        } else {
            required
        }
    }

    async fn data_bounds(&self) -> Result<(u32, u32), StoreError> {
        let layout = &self.config.layout;
        let first = self
            .config
            .start_row
            .unwrap_or(0)
            .max(layout.first_data_row());
        let used = self.store.last_row(&layout.sheet, &layout.url_column).await?;
        let last = match self.config.end_row {
            Some(end) => end.min(used),
            None => used,
        };
        Ok((first, last))
    }

    /// Cursor at the start of the configured traversal.
    pub async fn start(&self) -> Result<Cursor, StoreError> {
        let (first, last) = self.data_bounds().await?;
        let next = match self.config.traversal {
            Traversal::BottomUp => last,
            _ => first,
        };
        debug!(
            "{} traversal of {} rows {}..={}",
            self.config.traversal, self.config.layout.sheet, first, last
        );
        Ok(Cursor { next, first, last })
    }

    /// Decide whether a row needs work and, if so, build its item.
    pub fn item_for_row(&self, row_number: u32, row: &[String]) -> Option<WorkItem> {
        let layout = &self.config.layout;
        let url = layout.cell(row, &layout.url_column).trim();
        if url.is_empty() {
            return None;
        }

        let mut existing = BTreeMap::new();
        for field in layout.output_fields() {
            if let Some(column) = layout.column_for(field) {
                if let Some(value) = FieldValue::from_store_str(layout.cell(row, column)) {
                    existing.insert(field, value);
                }
            }
        }

        let processed = self.gating_fields().iter().any(|f| existing.contains_key(f));
        let fields_needed: BTreeSet<Field> = if self.force {
            layout.output_fields()
        } else if processed {
            return None;
        } else {
            layout
                .output_fields()
                .into_iter()
                .filter(|f| !existing.contains_key(f))
                .collect()
        };

        let mut item = WorkItem::new(RowKey::new(&layout.sheet, row_number), url, fields_needed);
        item.existing = existing;
        Some(item)
    }

    async fn read_span(&self, from: u32, to: u32) -> Result<Vec<(u32, Vec<String>)>, StoreError> {
        let layout = &self.config.layout;
        let Some((first_col, last_col)) = layout.column_bounds() else {
            return Ok(Vec::new());
        };
        let rows = self
            .store
            .read_rows(
                &layout.sheet,
                &column_letter(first_col),
                &column_letter(last_col),
                RowSpan::new(from, Some(to)),
            )
            .await?;
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| (from + i as u32, row))
            .collect())
    }

    /// Next batch of items from `cursor`.
    pub async fn next_batch(&self, cursor: Cursor) -> Result<Batch, StoreError> {
        let traversal = self.config.traversal;
        let chunk = self.config.read_chunk.max(1);
        let batch_size = self.config.batch_size.max(1);
        let mut cursor = cursor;
        let mut items = Vec::new();

        if traversal == Traversal::Streaming {
            // Follow rows appended since the last read.
            let (_, last) = self.data_bounds().await?;
            cursor.last = last;
        }

        while items.len() < batch_size && !cursor.is_past_end(traversal) {
            let (from, to) = match traversal {
                Traversal::BottomUp => (
                    cursor.next.saturating_sub(chunk - 1).max(cursor.first),
                    cursor.next,
                ),
                Traversal::TopDown => (cursor.next, cursor.next.saturating_add(chunk - 1).min(cursor.last)),
                Traversal::Streaming => (
                    cursor.next,
                    cursor
                        .next
                        .saturating_add(batch_size as u32 - 1)
                        .min(cursor.last),
                ),
            };

            let mut rows = self.read_span(from, to).await?;
            if traversal == Traversal::BottomUp {
                rows.reverse();
            }

            // Resume mid-chunk when the batch fills up.
            let mut consumed_to = None;
            for (row_number, row) in &rows {
                if items.len() >= batch_size {
                    break;
                }
                if let Some(item) = self.item_for_row(*row_number, row) {
                    items.push(item);
                }
                consumed_to = Some(*row_number);
            }

            cursor.next = match (traversal, consumed_to) {
                (Traversal::BottomUp, Some(row)) if items.len() >= batch_size => row.saturating_sub(1),
                (Traversal::BottomUp, _) => from.saturating_sub(1),
                (_, Some(row)) if items.len() >= batch_size => row + 1,
                _ => to + 1,
            };

            if traversal == Traversal::Streaming {
                break;
            }
        }

        let exhausted = cursor.is_past_end(traversal);
        debug!(
            "Batch of {} items from {} (next row {}, exhausted={})",
            items.len(),
            self.config.layout.sheet,
            cursor.next,
            exhausted
        );
        Ok(Batch {
            items,
            next: cursor,
            exhausted,
        })
    }
}
