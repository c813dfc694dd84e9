//! Google Sheets v4 REST client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{CellUpdate, RowSpan, StoreError, TabularStore};

pub const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

pub struct SheetsClient {
    http: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    access_token: String,
}

impl SheetsClient {
    pub fn new(
        spreadsheet_id: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Fatal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: DEFAULT_SHEETS_BASE_URL.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            access_token: access_token.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// A1 range with the sheet name quoted.
    pub fn a1(sheet: &str, range: &str) -> String {
        format!("'{}'!{}", sheet.replace('\'', "''"), range)
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/{}/values/{}",
            self.base_url,
            self.spreadsheet_id,
            urlencoding::encode(range)
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(StoreError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, StoreError> {
        debug!("Reading {}", range);
        let response = self
            .http
            .get(self.values_url(range))
            .bearer_auth(&self.access_token)
            .query(&[("majorDimension", "ROWS")])
            .send()
            .await?;
        let body: ValueRange = Self::check(response).await?.json().await?;
        Ok(body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_string).collect())
            .collect())
    }
}

fn cell_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl TabularStore for SheetsClient {
    async fn read_rows(
        &self,
        sheet: &str,
        first_col: &str,
        last_col: &str,
        rows: RowSpan,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        let range = match rows.last {
            Some(last) => format!("{}{}:{}{}", first_col, rows.first, last_col, last),
            None => format!("{}{}:{}", first_col, rows.first, last_col),
        };
        let width = match (super::column_index(first_col), super::column_index(last_col)) {
            (Some(first), Some(last)) if last >= first => (last - first + 1) as usize,
            _ => {
                return Err(StoreError::Fatal(format!(
                    "invalid column range {}:{}",
                    first_col, last_col
                )))
            }
        };

        let mut values = self.get_values(&Self::a1(sheet, &range)).await?;
        for row in &mut values {
            row.resize(width, String::new());
        }
        Ok(values)
    }

    async fn last_row(&self, sheet: &str, column: &str) -> Result<u32, StoreError> {
        let values = self
            .get_values(&Self::a1(sheet, &format!("{}:{}", column, column)))
            .await?;
        let last = values
            .iter()
            .rposition(|row| row.first().is_some_and(|c| !c.is_empty()))
            .map(|idx| idx as u32 + 1)
            .unwrap_or(0);
        Ok(last)
    }

    async fn update_cells(&self, updates: &[CellUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let data: Vec<serde_json::Value> = updates
            .iter()
            .map(|u| {
                json!({
                    "range": Self::a1(&u.key.sheet, &format!("{}{}", u.column, u.key.row)),
                    "values": [[u.value]],
                })
            })
            .collect();
        let body = json!({
            "valueInputOption": "RAW",
            "data": data,
        });

        let url = format!("{}/{}/values:batchUpdate", self.base_url, self.spreadsheet_id);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        debug!("Updated {} cells", updates.len());
        Ok(())
    }

    async fn append_rows(&self, sheet: &str, rows: &[Vec<String>]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = format!("{}:append", self.values_url(&Self::a1(sheet, "A1")));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .query(&[
                ("valueInputOption", "RAW"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&json!({ "values": rows }))
            .send()
            .await?;
        Self::check(response).await?;
        debug!("Appended {} rows to {}", rows.len(), sheet);
        Ok(())
    }
}
