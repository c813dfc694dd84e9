//! The ordered fallback strategies used by the field extractor.
//!
//! Each strategy reads the rendered document and proposes already-cleaned
//! candidates for the fields it was asked about. Unreadable frames simply
//! contribute nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use super::document::RenderedDocument;
use super::normalize::{
    canonical_store_link, is_package_id, package_of, play_link_for_package, store_links_in,
    Normalizer,
};
use super::ExtractConfig;
use crate::model::{Field, FieldValue};

/// Quoted or parameter-bound bare package identifiers in raw markup.
static RAW_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:[?&]id=|["'])([a-z][a-z0-9_]*(?:\.[a-z0-9_]+){2,})(?:["'&#]|$)"#).unwrap()
});

/// Fast-path package match inside a metadata payload.
static PAYLOAD_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:details\?id=|id%3D|\\u003did=|"(?:appId|packageName|package_name|app_id)"\s*:\s*")([A-Za-z][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)+)"#).unwrap()
});

/// Trailing segments that mark a dotted token as a file or host, not a package.
const NON_PACKAGE_SUFFIXES: &[&str] = &[
    ".com", ".net", ".org", ".io", ".js", ".css", ".html", ".htm", ".png", ".jpg", ".gif",
    ".svg", ".webp", ".json", ".php",
];

/// Everything a strategy needs besides the document.
pub struct ExtractionContext<'a> {
    pub doc: &'a RenderedDocument,
    pub config: &'a ExtractConfig,
    pub label: &'a Normalizer,
    pub tagline: &'a Normalizer,
}

impl ExtractionContext<'_> {
    /// Validate a link candidate and reject denylisted namespaces.
    pub fn accept_link(&self, raw: &str) -> Option<String> {
        let link = canonical_store_link(raw)?;
        if let Some(package) = package_of(&link) {
            if self.is_denied_package(&package) {
                debug!("Rejected denylisted package {}", package);
                return None;
            }
        }
        Some(link)
    }

    pub fn accept_package(&self, package: &str) -> Option<String> {
        if !is_package_id(package) || self.is_denied_package(package) {
            return None;
        }
        let lower = package.to_lowercase();
        if NON_PACKAGE_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            return None;
        }
        Some(play_link_for_package(package))
    }

    fn is_denied_package(&self, package: &str) -> bool {
        let lower = package.to_lowercase();
        self.config
            .denied_namespaces
            .iter()
            .any(|ns| lower == *ns || lower.starts_with(&format!("{}.", ns)))
    }

    pub fn clean_label(&self, raw: &str) -> Option<String> {
        as_text(self.label.clean(raw))
    }

    pub fn clean_tagline(&self, raw: &str) -> Option<String> {
        as_text(self.tagline.clean(raw))
    }

    /// Readable documents in scan order: prioritized frames, then the main document.
    fn frame_documents(&self) -> Vec<Html> {
        self.doc
            .frames_by_priority(&self.config.ad_hosts)
            .into_iter()
            .filter_map(|f| f.html.as_deref())
            .chain(std::iter::once(self.doc.html.as_str()))
            .map(Html::parse_document)
            .collect()
    }
}

fn as_text(value: FieldValue) -> Option<String> {
    match value {
        FieldValue::Value(v) => Some(v),
        _ => None,
    }
}

/// Cleaned candidate values, keyed by field.
pub type Candidates = BTreeMap<Field, String>;

/// One fallback heuristic with a uniform input/output contract.
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether values from this strategy are high-confidence.
    fn confident(&self) -> bool;

    /// Propose candidates for the `wanted` fields.
    fn extract(&self, ctx: &ExtractionContext<'_>, wanted: &BTreeSet<Field>) -> Candidates;
}

/// Compile configured selectors, skipping (and logging) invalid ones.
fn compile(selectors: &[String]) -> Vec<Selector> {
    selectors
        .iter()
        .filter_map(|s| match Selector::parse(s) {
            Ok(sel) => Some(sel),
            Err(e) => {
                warn!("Ignoring invalid selector {:?}: {:?}", s, e);
                None
            }
        })
        .collect()
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ")
}

/// Embedded metadata carriers: attributes holding serialized payloads and
/// JSON-LD scripts.
pub struct StructuredDataStrategy {
    carriers: Vec<(Selector, Option<String>)>,
}

impl StructuredDataStrategy {
    pub fn new(config: &ExtractConfig) -> Self {
        let mut carriers: Vec<(Selector, Option<String>)> = config
            .carrier_attributes
            .iter()
            .filter_map(|attr| {
                Selector::parse(&format!("[{}]", attr))
                    .ok()
                    .map(|sel| (sel, Some(attr.clone())))
            })
            .collect();
        if let Ok(ld) = Selector::parse(r#"script[type="application/ld+json"]"#) {
            carriers.push((ld, None));
        }
        Self { carriers }
    }

    fn payloads(&self, html: &Html) -> Vec<String> {
        let mut out = Vec::new();
        for (selector, attr) in &self.carriers {
            for el in html.select(selector) {
                match attr {
                    Some(attr) => {
                        if let Some(v) = el.value().attr(attr) {
                            out.push(v.to_string());
                        }
                    }
                    None => out.push(el.text().collect()),
                }
            }
        }
        out
    }

    /// Full structural parse: walk every string in the payload.
    fn walk(
        ctx: &ExtractionContext<'_>,
        value: &serde_json::Value,
        key: Option<&str>,
        found: &mut Candidates,
    ) {
        match value {
            serde_json::Value::String(s) => {
                if !found.contains_key(&Field::StoreLink) {
                    let link = ctx.accept_link(s).or_else(|| match key {
                        Some("id" | "appId" | "packageName" | "package_name" | "app_id") => {
                            ctx.accept_package(s)
                        }
                        _ => None,
                    });
                    if let Some(link) = link {
                        found.insert(Field::StoreLink, link);
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    Self::walk(ctx, item, key, found);
                }
            }
            serde_json::Value::Object(map) => {
                let is_app = map
                    .get("@type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| t.ends_with("Application"));
                if is_app {
                    if let Some(name) = map.get("name").and_then(|v| v.as_str()) {
                        if let Some(label) = ctx.clean_label(name) {
                            found.entry(Field::AppName).or_insert(label);
                        }
                    }
                    if let Some(desc) = map.get("description").and_then(|v| v.as_str()) {
                        if let Some(tagline) = ctx.clean_tagline(desc) {
                            found.entry(Field::Tagline).or_insert(tagline);
                        }
                    }
                }
                for (k, v) in map {
                    Self::walk(ctx, v, Some(k.as_str()), found);
                }
            }
            _ => {}
        }
    }

    fn from_payload(ctx: &ExtractionContext<'_>, payload: &str, found: &mut Candidates) {
        if !found.contains_key(&Field::StoreLink) {
            let fast = ctx.accept_link(payload).or_else(|| {
                PAYLOAD_PACKAGE
                    .captures(payload)
                    .and_then(|caps| ctx.accept_package(&caps[1]))
            });
            if let Some(link) = fast {
                found.insert(Field::StoreLink, link);
            }
        }

        let needs_parse = !found.contains_key(&Field::StoreLink)
            || !found.contains_key(&Field::AppName)
            || !found.contains_key(&Field::Tagline);
        if needs_parse {
            match serde_json::from_str::<serde_json::Value>(payload.trim()) {
                Ok(value) => Self::walk(ctx, &value, None, found),
                Err(e) => debug!("Metadata payload is not JSON: {}", e),
            }
        }
    }
}

impl ExtractionStrategy for StructuredDataStrategy {
    fn name(&self) -> &'static str {
        "structured_data"
    }

    fn confident(&self) -> bool {
        true
    }

    fn extract(&self, ctx: &ExtractionContext<'_>, wanted: &BTreeSet<Field>) -> Candidates {
        let mut found = Candidates::new();
        for html in ctx.frame_documents() {
            for payload in self.payloads(&html) {
                Self::from_payload(ctx, &payload, &mut found);
                if wanted.iter().all(|f| found.contains_key(f)) {
                    break;
                }
            }
        }
        found.retain(|f, _| wanted.contains(f));
        found
    }
}

/// Semantic anchors: app-name links and install buttons inside ad frames.
pub struct AnchorStrategy {
    name_anchors: Vec<Selector>,
    install_anchors: Vec<Selector>,
    description_anchors: Vec<Selector>,
}

impl AnchorStrategy {
    pub fn new(config: &ExtractConfig) -> Self {
        Self {
            name_anchors: compile(&config.name_anchor_selectors),
            install_anchors: compile(&config.install_anchor_selectors),
            description_anchors: compile(&config.description_anchor_selectors),
        }
    }

    fn href_link(ctx: &ExtractionContext<'_>, el: &ElementRef<'_>) -> Option<String> {
        ["href", "data-href", "data-original-click-url"]
            .iter()
            .filter_map(|attr| el.value().attr(attr))
            .find_map(|href| ctx.accept_link(href))
    }
}

impl ExtractionStrategy for AnchorStrategy {
    fn name(&self) -> &'static str {
        "anchor"
    }

    fn confident(&self) -> bool {
        true
    }

    fn extract(&self, ctx: &ExtractionContext<'_>, wanted: &BTreeSet<Field>) -> Candidates {
        let mut found = Candidates::new();

        for html in ctx.frame_documents() {
            for selector in &self.name_anchors {
                for el in html.select(selector) {
                    let label = ctx.clean_label(&element_text(&el));
                    let link = Self::href_link(ctx, &el);
                    if let (Some(label), Some(link)) = (&label, &link) {
                        // A single anchor carrying both wins outright.
                        let mut winner = Candidates::new();
                        winner.insert(Field::AppName, label.clone());
                        winner.insert(Field::StoreLink, link.clone());
                        if wanted.contains(&Field::Tagline) {
                            if let Some(tagline) = self.first_description(ctx, &html) {
                                winner.insert(Field::Tagline, tagline);
                            }
                        }
                        winner.retain(|f, _| wanted.contains(f));
                        return winner;
                    }
                    if let Some(label) = label {
                        found.entry(Field::AppName).or_insert(label);
                    }
                    if let Some(link) = link {
                        found.entry(Field::StoreLink).or_insert(link);
                    }
                }
            }

            if !found.contains_key(&Field::StoreLink) {
                let link = self
                    .install_anchors
                    .iter()
                    .flat_map(|sel| html.select(sel))
                    .find_map(|el| Self::href_link(ctx, &el));
                if let Some(link) = link {
                    found.insert(Field::StoreLink, link);
                }
            }

            if wanted.contains(&Field::Tagline) && !found.contains_key(&Field::Tagline) {
                if let Some(tagline) = self.first_description(ctx, &html) {
                    found.insert(Field::Tagline, tagline);
                }
            }
        }

        found.retain(|f, _| wanted.contains(f));
        found
    }
}

impl AnchorStrategy {
    fn first_description(&self, ctx: &ExtractionContext<'_>, html: &Html) -> Option<String> {
        self.description_anchors
            .iter()
            .flat_map(|sel| html.select(sel))
            .find_map(|el| ctx.clean_tagline(&element_text(&el)))
    }
}

/// Generic heading-role and description-like elements.
pub struct HeadingStrategy {
    headings: Vec<Selector>,
    descriptions: Vec<Selector>,
}

impl HeadingStrategy {
    pub fn new(config: &ExtractConfig) -> Self {
        Self {
            headings: compile(&config.heading_selectors),
            descriptions: compile(&config.description_selectors),
        }
    }
}

impl ExtractionStrategy for HeadingStrategy {
    fn name(&self) -> &'static str {
        "heading"
    }

    fn confident(&self) -> bool {
        false
    }

    fn extract(&self, ctx: &ExtractionContext<'_>, wanted: &BTreeSet<Field>) -> Candidates {
        let mut found = Candidates::new();
        for html in ctx.frame_documents() {
            if wanted.contains(&Field::AppName) && !found.contains_key(&Field::AppName) {
                let label = self
                    .headings
                    .iter()
                    .flat_map(|sel| html.select(sel))
                    .find_map(|el| ctx.clean_label(&element_text(&el)));
                if let Some(label) = label {
                    found.insert(Field::AppName, label);
                }
            }
            if wanted.contains(&Field::Tagline) && !found.contains_key(&Field::Tagline) {
                let tagline = self
                    .descriptions
                    .iter()
                    .flat_map(|sel| html.select(sel))
                    .find_map(|el| ctx.clean_tagline(&element_text(&el)));
                if let Some(tagline) = tagline {
                    found.insert(Field::Tagline, tagline);
                }
            }
            if wanted.iter().all(|f| found.contains_key(f) || *f == Field::StoreLink) {
                break;
            }
        }
        found
    }
}

/// Last resort: regex scan over the raw HTML of every document.
pub struct RawContentStrategy;

impl ExtractionStrategy for RawContentStrategy {
    fn name(&self) -> &'static str {
        "raw_content"
    }

    fn confident(&self) -> bool {
        false
    }

    fn extract(&self, ctx: &ExtractionContext<'_>, wanted: &BTreeSet<Field>) -> Candidates {
        let mut found = Candidates::new();
        if !wanted.contains(&Field::StoreLink) {
            return found;
        }

        let sources = ctx.doc.all_html();
        let link = sources
            .iter()
            .flat_map(|html| store_links_in(html))
            .find_map(|candidate| ctx.accept_link(&candidate))
            .or_else(|| {
                sources.iter().find_map(|html| {
                    RAW_PACKAGE
                        .captures_iter(html)
                        .find_map(|caps| ctx.accept_package(&caps[1]))
                })
            });
        if let Some(link) = link {
            found.insert(Field::StoreLink, link);
        }
        found
    }
}

/// The default chain: structured data, anchors, headings, raw content.
pub fn default_chain(config: &ExtractConfig) -> Vec<Box<dyn ExtractionStrategy>> {
    vec![
        Box::new(StructuredDataStrategy::new(config)),
        Box::new(AnchorStrategy::new(config)),
        Box::new(HeadingStrategy::new(config)),
        Box::new(RawContentStrategy),
    ]
}
