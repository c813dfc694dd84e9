//! Row-oriented access to the remote tabular store.

mod memory;
mod sheets;

pub use memory::{DryRunStore, MemoryStore};
pub use sheets::{SheetsClient, DEFAULT_SHEETS_BASE_URL};

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Field, RowKey};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store temporarily unavailable: {0}")]
    Transient(String),
    #[error("store request failed: {0}")]
    Fatal(String),
    #[error("store returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("failed to decode store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// Rate-limit and server-unavailable signatures worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Self::Transient(e.to_string())
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

/// One cell write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpdate {
    pub key: RowKey,
    /// Column letter(s), e.g. `C`.
    pub column: String,
    pub value: String,
}

/// Rows `first..=last` (1-based); `last = None` reads to the end of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSpan {
    pub first: u32,
    pub last: Option<u32>,
}

impl RowSpan {
    pub fn new(first: u32, last: Option<u32>) -> Self {
        Self { first, last }
    }
}

/// The store as the pipeline sees it: row reads, cell updates and appends.
///
/// Missing cells read back as empty strings. Writes use raw input mode.
#[async_trait]
pub trait TabularStore: Send + Sync {
    /// Values of columns `first_col..=last_col` for `rows`, one vector per row,
    /// each padded to the full column width. Trailing empty rows may be omitted.
    async fn read_rows(
        &self,
        sheet: &str,
        first_col: &str,
        last_col: &str,
        rows: RowSpan,
    ) -> Result<Vec<Vec<String>>, StoreError>;

    /// Row number of the last non-empty cell in `column` (0 when empty).
    async fn last_row(&self, sheet: &str, column: &str) -> Result<u32, StoreError>;

    async fn update_cells(&self, updates: &[CellUpdate]) -> Result<(), StoreError>;

    /// Insert-append rows after the last row of data in `sheet`.
    async fn append_rows(&self, sheet: &str, rows: &[Vec<String>]) -> Result<(), StoreError>;
}

/// 0-based index of a column letter (`A` = 0, `AA` = 26).
pub fn column_index(letters: &str) -> Option<u32> {
    let letters = letters.trim();
    if letters.is_empty() {
        return None;
    }
    letters.chars().try_fold(0u32, |acc, c| {
        let c = c.to_ascii_uppercase();
        if !c.is_ascii_uppercase() {
            return None;
        }
        acc.checked_mul(26)?.checked_add(c as u32 - 'A' as u32 + 1)
    })
    .map(|n| n - 1)
}

/// Column letters for a 0-based index.
pub fn column_letter(index: u32) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    out.iter().rev().collect()
}

/// Column layout of one sheet variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetLayout {
    pub sheet: String,
    /// Rows above the data (headers).
    #[serde(default = "default_header_rows")]
    pub header_rows: u32,
    /// Column holding the page to visit.
    #[serde(default = "default_url_column")]
    pub url_column: String,
    #[serde(default = "default_link_column")]
    pub link_column: Option<String>,
    #[serde(default = "default_label_column")]
    pub label_column: Option<String>,
    #[serde(default = "default_tagline_column")]
    pub tagline_column: Option<String>,
}

fn default_header_rows() -> u32 {
    1
}

fn default_url_column() -> String {
    "B".to_string()
}

fn default_link_column() -> Option<String> {
    Some("C".to_string())
}

fn default_label_column() -> Option<String> {
    Some("D".to_string())
}

fn default_tagline_column() -> Option<String> {
    Some("E".to_string())
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self::new("Sheet1")
    }
}

impl SheetLayout {
    pub fn new(sheet: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            header_rows: default_header_rows(),
            url_column: default_url_column(),
            link_column: default_link_column(),
            label_column: default_label_column(),
            tagline_column: default_tagline_column(),
        }
    }

    pub fn column_for(&self, field: Field) -> Option<&str> {
        match field {
            Field::StoreLink => self.link_column.as_deref(),
            Field::AppName => self.label_column.as_deref(),
            Field::Tagline => self.tagline_column.as_deref(),
        }
    }

    /// Fields this sheet has an output column for.
    pub fn output_fields(&self) -> BTreeSet<Field> {
        Field::ALL
            .into_iter()
            .filter(|f| self.column_for(*f).is_some())
            .collect()
    }

    /// First data row (1-based).
    pub fn first_data_row(&self) -> u32 {
        self.header_rows + 1
    }

    /// Leftmost and rightmost columns touched by this layout, as indexes.
    pub fn column_bounds(&self) -> Option<(u32, u32)> {
        let indexes: Vec<u32> = std::iter::once(self.url_column.as_str())
            .chain(Field::ALL.iter().filter_map(|f| self.column_for(*f)))
            .filter_map(column_index)
            .collect();
        Some((*indexes.iter().min()?, *indexes.iter().max()?))
    }

    /// Cell of `row` (read with [`Self::column_bounds`]) at column `letters`.
    pub fn cell<'a>(&self, row: &'a [String], letters: &str) -> &'a str {
        let (Some((first, _)), Some(idx)) = (self.column_bounds(), column_index(letters)) else {
            return "";
        };
        idx.checked_sub(first)
            .and_then(|offset| row.get(offset as usize))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// Check that every configured column parses.
    pub fn validate(&self) -> Result<(), String> {
        if self.sheet.trim().is_empty() {
            return Err("sheet name is empty".to_string());
        }
        for letters in std::iter::once(self.url_column.as_str())
            .chain(Field::ALL.iter().filter_map(|f| self.column_for(*f)))
        {
            if column_index(letters).is_none() {
                return Err(format!("invalid column {:?} in sheet {}", letters, self.sheet));
            }
        }
        if self.output_fields().is_empty() {
            return Err(format!("sheet {} has no output columns", self.sheet));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters_round_trip_at_boundaries() {
        assert_eq!(column_index("A"), Some(0));
        assert_eq!(column_index("z"), Some(25));
        assert_eq!(column_index("AA"), Some(26));
        assert_eq!(column_index("A1"), None);
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(701), "ZZ");
    }

    #[test]
    fn oversized_column_is_rejected() {
        assert_eq!(column_index("MWLQKWU"), Some(u32::MAX - 1));
        assert_eq!(column_index("MWLQKWV"), None);
        assert_eq!(column_index("ZZZZZZZZZZZZ"), None);
        assert!(SheetLayout {
            url_column: "ZZZZZZZZZZZZ".into(),
            ..SheetLayout::new("Ads")
        }
        .validate()
        .is_err());
    }

    #[test]
    fn layout_reads_cells_relative_to_bounds() {
        let layout = SheetLayout::new("Ads");
        assert_eq!(layout.column_bounds(), Some((1, 4)));
        let row: Vec<String> = ["https://ad", "link", "label"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(layout.cell(&row, "B"), "https://ad");
        assert_eq!(layout.cell(&row, "D"), "label");
        assert_eq!(layout.cell(&row, "E"), "");
        assert_eq!(layout.cell(&row, "A"), "");
    }

    #[test]
    fn transient_classification() {
        let status = |status| StoreError::Http {
            status,
            message: String::new(),
        };
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(!status(400).is_transient());
        assert!(!status(403).is_transient());
        assert!(StoreError::Transient("reset".into()).is_transient());
        assert!(!StoreError::Decode("bad".into()).is_transient());
    }

    #[test]
    fn layout_without_outputs_is_invalid() {
        let layout = SheetLayout {
            link_column: None,
            label_column: None,
            tagline_column: None,
            ..SheetLayout::new("Ads")
        };
        assert!(layout.validate().is_err());
        assert!(SheetLayout::new("Ads").validate().is_ok());
    }
}
