//! Core data types shared by every pipeline stage.
//!
//! A [`WorkItem`] flows from the work source through the retry controller,
//! which produces an [`ExtractionResult`]. Field values are either real text
//! or one of the reserved sentinels, never an empty string.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Output fields harvested from an ad detail page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Destination app-store link.
    StoreLink,
    /// App name shown on the creative.
    AppName,
    /// Short tagline / description line.
    Tagline,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::StoreLink, Field::AppName, Field::Tagline];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreLink => "store_link",
            Self::AppName => "app_name",
            Self::Tagline => "tagline",
        }
    }

    /// Parse from string (for CLI/env var).
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "store_link" | "link" | "destination" => Some(Self::StoreLink),
            "app_name" | "name" | "label" => Some(Self::AppName),
            "tagline" | "subtitle" | "description" => Some(Self::Tagline),
            _ => None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const NOT_FOUND: &str = "NOT_FOUND";
pub const BLOCKED: &str = "BLOCKED";
pub const ERROR: &str = "ERROR";

/// A harvested value or a sentinel standing in for "no usable data".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Value(String),
    NotFound,
    Blocked,
    Error,
}

impl FieldValue {
    pub fn is_sentinel(&self) -> bool {
        !matches!(self, Self::Value(_))
    }

    pub fn as_value(&self) -> Option<&str> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Text written to the store for this value.
    pub fn as_store_str(&self) -> &str {
        match self {
            Self::Value(v) => v,
            Self::NotFound => NOT_FOUND,
            Self::Blocked => BLOCKED,
            Self::Error => ERROR,
        }
    }

    /// Interpret a store cell. Empty cells have no value at all.
    pub fn from_store_str(cell: &str) -> Option<Self> {
        match cell.trim() {
            "" => None,
            NOT_FOUND => Some(Self::NotFound),
            BLOCKED => Some(Self::Blocked),
            ERROR => Some(Self::Error),
            other => Some(Self::Value(other.to_string())),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_store_str())
    }
}

/// Identity of a work item: the sheet it came from and its 1-based row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub sheet: String,
    pub row: u32,
}

impl RowKey {
    pub fn new(sheet: impl Into<String>, row: u32) -> Self {
        Self {
            sheet: sheet.into(),
            row,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.sheet, self.row)
    }
}

/// One row to visit. Immutable once dequeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: RowKey,
    pub source_url: String,
    pub fields_needed: BTreeSet<Field>,
    /// Non-empty output cells already present in the store.
    pub existing: BTreeMap<Field, FieldValue>,
}

impl WorkItem {
    pub fn new(key: RowKey, source_url: impl Into<String>, fields_needed: BTreeSet<Field>) -> Self {
        Self {
            key,
            source_url: source_url.into(),
            fields_needed,
            existing: BTreeMap::new(),
        }
    }
}

/// Field values produced by the extractor, refined across attempts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    pub values: BTreeMap<Field, FieldValue>,
    /// Whether each value came from a high-confidence strategy.
    pub confidence: BTreeMap<Field, bool>,
    /// Name of the strategy that produced each value.
    pub resolved_by: BTreeMap<Field, &'static str>,
    /// Strategies that ran, in order, during the last extraction.
    pub strategies_run: Vec<&'static str>,
}

impl ExtractionResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result with every field set to the same sentinel.
    pub fn sentinel(fields: &BTreeSet<Field>, value: FieldValue) -> Self {
        let mut result = Self::new();
        for field in fields {
            result.values.insert(*field, value.clone());
            result.confidence.insert(*field, false);
        }
        result
    }

    pub fn blocked(fields: &BTreeSet<Field>) -> Self {
        Self::sentinel(fields, FieldValue::Blocked)
    }

    pub fn error(fields: &BTreeSet<Field>) -> Self {
        Self::sentinel(fields, FieldValue::Error)
    }

    pub fn set(&mut self, field: Field, value: FieldValue, confident: bool, by: &'static str) {
        self.values.insert(field, value);
        self.confidence.insert(field, confident);
        self.resolved_by.insert(field, by);
    }

    pub fn get(&self, field: Field) -> Option<&FieldValue> {
        self.values.get(&field)
    }

    pub fn value(&self, field: Field) -> Option<&str> {
        self.values.get(&field).and_then(FieldValue::as_value)
    }

    pub fn is_resolved(&self, field: Field) -> bool {
        self.value(field).is_some()
    }

    /// Every required field has a non-sentinel value.
    pub fn is_complete(&self, required: &BTreeSet<Field>) -> bool {
        required.iter().all(|f| self.is_resolved(*f))
    }

    pub fn any_resolved(&self) -> bool {
        self.values.values().any(|v| !v.is_sentinel())
    }

    pub fn is_blocked(&self) -> bool {
        !self.values.is_empty()
            && self.values.values().all(|v| matches!(v, FieldValue::Blocked))
    }

    /// Give every field in `fields` that has no entry the `NOT_FOUND` sentinel.
    pub fn fill_missing(&mut self, fields: &BTreeSet<Field>) {
        for field in fields {
            self.values.entry(*field).or_insert(FieldValue::NotFound);
            self.confidence.entry(*field).or_insert(false);
        }
    }

    /// Merge a later attempt into this best-so-far result.
    ///
    /// A non-sentinel value is never replaced by a sentinel. A later value
    /// replaces an earlier sentinel; between two real values the earlier one
    /// is kept unless only the later one is high-confidence.
    pub fn merge(&mut self, later: ExtractionResult) {
        for (field, new_value) in later.values {
            let new_conf = later.confidence.get(&field).copied().unwrap_or(false);
            let replace = match self.values.get(&field) {
                None => true,
                Some(old) if old.is_sentinel() => true,
                Some(_) if new_value.is_sentinel() => false,
                Some(_) => new_conf && !self.confidence.get(&field).copied().unwrap_or(false),
            };
            if replace {
                self.values.insert(field, new_value);
                self.confidence.insert(field, new_conf);
                match later.resolved_by.get(&field).copied() {
                    Some(by) => {
                        self.resolved_by.insert(field, by);
                    }
                    None => {
                        self.resolved_by.remove(&field);
                    }
                }
            }
        }
        self.strategies_run = later.strategies_run;
    }
}

/// Final classification of one item, reported per outcome in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every required field resolved.
    Resolved,
    /// Some but not all required fields resolved.
    Partial,
    /// The extractor ran cleanly and found nothing.
    NotFound,
    /// Every attempt hit a block page.
    Blocked,
    /// Page load or session failure on every attempt.
    Error,
}

impl Outcome {
    pub fn classify(result: &ExtractionResult, required: &BTreeSet<Field>) -> Self {
        if result.is_complete(required) {
            return Self::Resolved;
        }
        if required.iter().any(|f| result.is_resolved(*f)) {
            return Self::Partial;
        }
        if result.is_blocked() {
            return Self::Blocked;
        }
        let any_error = required
            .iter()
            .any(|f| matches!(result.get(*f), Some(FieldValue::Error)));
        if any_error {
            Self::Error
        } else {
            Self::NotFound
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Partial => "partial",
            Self::NotFound => "not_found",
            Self::Blocked => "blocked",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(list: &[Field]) -> BTreeSet<Field> {
        list.iter().copied().collect()
    }

    #[test]
    fn sentinel_store_strings_round_trip() {
        assert_eq!(FieldValue::from_store_str(""), None);
        assert_eq!(FieldValue::from_store_str("  "), None);
        assert_eq!(FieldValue::from_store_str("NOT_FOUND"), Some(FieldValue::NotFound));
        assert_eq!(FieldValue::from_store_str("BLOCKED"), Some(FieldValue::Blocked));
        assert_eq!(
            FieldValue::from_store_str("Foo App"),
            Some(FieldValue::Value("Foo App".to_string()))
        );
    }

    #[test]
    fn merge_never_replaces_value_with_sentinel() {
        let mut best = ExtractionResult::new();
        best.set(Field::AppName, FieldValue::Value("Foo".into()), false, "heading");

        let mut later = ExtractionResult::new();
        later.set(Field::AppName, FieldValue::NotFound, false, "none");
        later.set(Field::StoreLink, FieldValue::Error, false, "none");
        best.merge(later);

        assert_eq!(best.value(Field::AppName), Some("Foo"));
        assert_eq!(best.get(Field::StoreLink), Some(&FieldValue::Error));
    }

    #[test]
    fn merge_replaces_sentinel_with_later_value() {
        let mut best = ExtractionResult::sentinel(&fields(&Field::ALL), FieldValue::NotFound);
        let mut later = ExtractionResult::new();
        later.set(
            Field::StoreLink,
            FieldValue::Value("https://play.google.com/store/apps/details?id=com.a.b".into()),
            true,
            "structured_data",
        );
        best.merge(later);

        assert!(best.is_resolved(Field::StoreLink));
        assert_eq!(best.resolved_by.get(&Field::StoreLink), Some(&"structured_data"));
        assert!(!best.is_resolved(Field::AppName));
    }

    #[test]
    fn merge_prefers_confident_value_over_heuristic() {
        let mut best = ExtractionResult::new();
        best.set(Field::AppName, FieldValue::Value("Sponsored Foo".into()), false, "heading");
        let mut later = ExtractionResult::new();
        later.set(Field::AppName, FieldValue::Value("Foo".into()), true, "anchor");
        best.merge(later);
        assert_eq!(best.value(Field::AppName), Some("Foo"));

        let mut weaker = ExtractionResult::new();
        weaker.set(Field::AppName, FieldValue::Value("Bar".into()), false, "raw");
        best.merge(weaker);
        assert_eq!(best.value(Field::AppName), Some("Foo"));
    }

    #[test]
    fn outcome_taxonomy() {
        let required = fields(&[Field::StoreLink, Field::AppName]);

        let blocked = ExtractionResult::blocked(&required);
        assert_eq!(Outcome::classify(&blocked, &required), Outcome::Blocked);

        let errored = ExtractionResult::error(&required);
        assert_eq!(Outcome::classify(&errored, &required), Outcome::Error);

        let mut partial = ExtractionResult::sentinel(&required, FieldValue::NotFound);
        partial.set(Field::AppName, FieldValue::Value("Foo".into()), true, "anchor");
        assert_eq!(Outcome::classify(&partial, &required), Outcome::Partial);

        partial.set(Field::StoreLink, FieldValue::Value("x".into()), true, "anchor");
        assert_eq!(Outcome::classify(&partial, &required), Outcome::Resolved);

        let empty = ExtractionResult::sentinel(&required, FieldValue::NotFound);
        assert_eq!(Outcome::classify(&empty, &required), Outcome::NotFound);
    }

    #[test]
    fn field_parses_aliases() {
        assert_eq!(Field::from_str("label"), Some(Field::AppName));
        assert_eq!(Field::from_str("store-link"), Some(Field::StoreLink));
        assert_eq!(Field::from_str("subtitle"), Some(Field::Tagline));
        assert_eq!(Field::from_str("bogus"), None);
    }
}
