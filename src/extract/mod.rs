//! Field extraction from rendered ad detail pages.
//!
//! A [`FieldExtractor`] runs an ordered chain of strategies over a
//! [`RenderedDocument`]. The first strategy to produce a clean value for a
//! field wins it; later strategies only see fields still missing.

pub mod document;
pub mod normalize;
pub mod strategies;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use document::{FrameSnapshot, RenderedDocument};
pub use normalize::Normalizer;
pub use strategies::{default_chain, Candidates, ExtractionContext, ExtractionStrategy};

use crate::model::{ExtractionResult, Field, FieldValue};
use normalize::first_sentence;

/// Tunables for the extraction chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Fields that must all resolve for an item to count as resolved.
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<Field>,
    /// Hosts whose frames are scanned before any other frame.
    #[serde(default = "default_ad_hosts")]
    pub ad_hosts: Vec<String>,
    /// Attributes that carry serialized ad metadata.
    #[serde(default = "default_carrier_attributes")]
    pub carrier_attributes: Vec<String>,
    /// Package namespaces that are never a valid destination (SDKs, system apps).
    #[serde(default = "default_denied_namespaces")]
    pub denied_namespaces: Vec<String>,
    #[serde(default = "default_name_anchor_selectors")]
    pub name_anchor_selectors: Vec<String>,
    #[serde(default = "default_install_anchor_selectors")]
    pub install_anchor_selectors: Vec<String>,
    #[serde(default = "default_description_anchor_selectors")]
    pub description_anchor_selectors: Vec<String>,
    #[serde(default = "default_heading_selectors")]
    pub heading_selectors: Vec<String>,
    #[serde(default = "default_description_selectors")]
    pub description_selectors: Vec<String>,
    /// Phrases rejected when they make up the entire candidate.
    #[serde(default = "default_blacklist_exact")]
    pub blacklist_exact: Vec<String>,
    /// Phrases rejected wherever they appear in a candidate.
    #[serde(default = "default_blacklist_contains")]
    pub blacklist_contains: Vec<String>,
    #[serde(default = "default_label_min_len")]
    pub label_min_len: usize,
    #[serde(default = "default_label_max_len")]
    pub label_max_len: usize,
    #[serde(default = "default_tagline_min_len")]
    pub tagline_min_len: usize,
    #[serde(default = "default_tagline_max_len")]
    pub tagline_max_len: usize,
    /// Longest label derived from a tagline's first sentence.
    #[serde(default = "default_label_from_tagline_max")]
    pub label_from_tagline_max: usize,
}

fn default_required_fields() -> Vec<Field> {
    vec![Field::StoreLink, Field::AppName]
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_ad_hosts() -> Vec<String> {
    strings(&[
        "googlesyndication.com",
        "doubleclick.net",
        "googleadservices.com",
        "googleusercontent.com",
        "2mdn.net",
    ])
}

fn default_carrier_attributes() -> Vec<String> {
    strings(&["data-asoch-meta", "data-ad-meta", "data-app-meta"])
}

fn default_denied_namespaces() -> Vec<String> {
    strings(&[
        "com.google.android.gms",
        "com.google.ads",
        "com.google.android.apps.ads",
        "com.android.vending",
        "com.android.chrome",
        "androidx",
        "android.support",
    ])
}

fn default_name_anchor_selectors() -> Vec<String> {
    strings(&[
        r#"a[data-asoch-targets*="AppName"]"#,
        r#"a[data-asoch-targets*="ochTitle"]"#,
        r#"a[class*="app-name"]"#,
        r#"a[class*="short-app-name"]"#,
    ])
}

fn default_install_anchor_selectors() -> Vec<String> {
    strings(&[
        r#"a[data-asoch-targets*="Button"]"#,
        r#"a[data-asoch-targets*="Install"]"#,
        r#"a[class*="install"]"#,
        r#"a[aria-label*="Install"]"#,
    ])
}

fn default_description_anchor_selectors() -> Vec<String> {
    strings(&[
        r#"a[data-asoch-targets*="Description"]"#,
        r#"a[data-asoch-targets*="ochBody"]"#,
    ])
}

fn default_heading_selectors() -> Vec<String> {
    strings(&[
        r#"[role="heading"]"#,
        "h1",
        "h2",
        "h3",
        r#"[class*="headline"]"#,
        r#"[class*="title"]"#,
    ])
}

fn default_description_selectors() -> Vec<String> {
    strings(&[
        r#"[class*="description"]"#,
        r#"[class*="tagline"]"#,
        r#"[class*="subtitle"]"#,
        r#"[class*="body-text"]"#,
    ])
}

fn default_blacklist_exact() -> Vec<String> {
    strings(&[
        "ad",
        "ads",
        "install",
        "open",
        "download",
        "get",
        "close",
        "next",
        "google play",
        "app store",
    ])
}

fn default_blacklist_contains() -> Vec<String> {
    strings(&[
        "ad details",
        "sponsored",
        "learn more",
        "why this ad",
        "about this ad",
        "advertisement",
        "ads by google",
        "visit site",
        "report this ad",
    ])
}

fn default_label_min_len() -> usize {
    2
}

fn default_label_max_len() -> usize {
    60
}

fn default_tagline_min_len() -> usize {
    10
}

fn default_tagline_max_len() -> usize {
    200
}

fn default_label_from_tagline_max() -> usize {
    50
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            required_fields: default_required_fields(),
            ad_hosts: default_ad_hosts(),
            carrier_attributes: default_carrier_attributes(),
            denied_namespaces: default_denied_namespaces(),
            name_anchor_selectors: default_name_anchor_selectors(),
            install_anchor_selectors: default_install_anchor_selectors(),
            description_anchor_selectors: default_description_anchor_selectors(),
            heading_selectors: default_heading_selectors(),
            description_selectors: default_description_selectors(),
            blacklist_exact: default_blacklist_exact(),
            blacklist_contains: default_blacklist_contains(),
            label_min_len: default_label_min_len(),
            label_max_len: default_label_max_len(),
            tagline_min_len: default_tagline_min_len(),
            tagline_max_len: default_tagline_max_len(),
            label_from_tagline_max: default_label_from_tagline_max(),
        }
    }
}

impl ExtractConfig {
    pub fn required_set(&self) -> BTreeSet<Field> {
        self.required_fields.iter().copied().collect()
    }

    pub fn label_normalizer(&self) -> Normalizer {
        Normalizer::new(self.label_min_len, self.label_max_len)
            .with_blacklist(&self.blacklist_exact, &self.blacklist_contains)
    }

    pub fn tagline_normalizer(&self) -> Normalizer {
        Normalizer::new(self.tagline_min_len, self.tagline_max_len)
            .with_blacklist(&self.blacklist_exact, &self.blacklist_contains)
    }
}

/// Pure function from a rendered document to field values.
pub trait Extractor: Send + Sync {
    fn extract(&self, doc: &RenderedDocument, fields: &BTreeSet<Field>) -> ExtractionResult;
}

/// Strategy-chain extractor.
pub struct FieldExtractor {
    config: ExtractConfig,
    strategies: Vec<Box<dyn ExtractionStrategy>>,
    label: Normalizer,
    tagline: Normalizer,
}

impl FieldExtractor {
    pub fn new(config: ExtractConfig) -> Self {
        let strategies = default_chain(&config);
        Self::with_strategies(config, strategies)
    }

    pub fn with_strategies(
        config: ExtractConfig,
        strategies: Vec<Box<dyn ExtractionStrategy>>,
    ) -> Self {
        let label = config.label_normalizer();
        let tagline = config.tagline_normalizer();
        Self {
            config,
            strategies,
            label,
            tagline,
        }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run the chain for `fields`, stopping as soon as none are missing.
    fn run_chain(
        &self,
        ctx: &ExtractionContext<'_>,
        fields: &BTreeSet<Field>,
        result: &mut ExtractionResult,
    ) {
        for strategy in &self.strategies {
            let pending: BTreeSet<Field> = fields
                .iter()
                .filter(|f| !result.is_resolved(**f))
                .copied()
                .collect();
            if pending.is_empty() {
                break;
            }

            result.strategies_run.push(strategy.name());
            let candidates = strategy.extract(ctx, &pending);
            for (field, value) in candidates {
                if pending.contains(&field) {
                    debug!("{} resolved {} via {}", ctx.doc.url, field, strategy.name());
                    result.set(
                        field,
                        FieldValue::Value(value),
                        strategy.confident(),
                        strategy.name(),
                    );
                }
            }
        }
    }
}

impl Extractor for FieldExtractor {
    fn extract(&self, doc: &RenderedDocument, fields: &BTreeSet<Field>) -> ExtractionResult {
        let ctx = ExtractionContext {
            doc,
            config: &self.config,
            label: &self.label,
            tagline: &self.tagline,
        };
        let mut result = ExtractionResult::new();

        let primary: BTreeSet<Field> = fields
            .iter()
            .filter(|f| **f != Field::Tagline)
            .copied()
            .collect();
        self.run_chain(&ctx, &primary, &mut result);

        // Taglines are only chased once the label is settled, or to stand in
        // for a missing label.
        let wants_tagline = fields.contains(&Field::Tagline);
        let label_missing = fields.contains(&Field::AppName) && !result.is_resolved(Field::AppName);
        let label_settled = !fields.contains(&Field::AppName) || result.is_resolved(Field::AppName);
        if (wants_tagline && label_settled) || label_missing {
            let mut tagline_pass = ExtractionResult::new();
            self.run_chain(&ctx, &BTreeSet::from([Field::Tagline]), &mut tagline_pass);
            result
                .strategies_run
                .extend(tagline_pass.strategies_run.iter().copied());

            if let Some(tagline) = tagline_pass.value(Field::Tagline) {
                if label_missing {
                    let label = first_sentence(tagline, self.config.label_from_tagline_max)
                        .and_then(|s| ctx.clean_label(&s));
                    if let Some(label) = label {
                        result.set(Field::AppName, FieldValue::Value(label), false, "tagline_sentence");
                    }
                }
                if wants_tagline {
                    let by = tagline_pass
                        .resolved_by
                        .get(&Field::Tagline)
                        .copied()
                        .unwrap_or("tagline");
                    let confident = tagline_pass
                        .confidence
                        .get(&Field::Tagline)
                        .copied()
                        .unwrap_or(false);
                    result.set(
                        Field::Tagline,
                        FieldValue::Value(tagline.to_string()),
                        confident,
                        by,
                    );
                }
            }
        }

        result.fill_missing(fields);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FieldExtractor {
        FieldExtractor::new(ExtractConfig::default())
    }

    fn fields(list: &[Field]) -> BTreeSet<Field> {
        list.iter().copied().collect()
    }

    fn ad_frame(html: &str) -> FrameSnapshot {
        FrameSnapshot::new(
            "https://tpc.googlesyndication.com/simgad/1",
            320.0,
            480.0,
            Some(html.to_string()),
        )
    }

    #[test]
    fn structured_metadata_short_circuits_the_chain() {
        let doc = RenderedDocument::new("https://ads.example.com/1", 200, "<html><body></body></html>")
            .with_frame(ad_frame(
                r#"<div data-asoch-meta='{"ad":{"click":"https://play.google.com/store/apps/details?id=com.example.app"}}'></div>"#,
            ));

        let result = extractor().extract(&doc, &fields(&[Field::StoreLink]));

        assert_eq!(
            result.value(Field::StoreLink),
            Some("https://play.google.com/store/apps/details?id=com.example.app")
        );
        assert_eq!(result.resolved_by.get(&Field::StoreLink), Some(&"structured_data"));
        assert_eq!(result.strategies_run, vec!["structured_data"]);
    }

    #[test]
    fn app_anchor_with_label_and_link_wins() {
        let doc = RenderedDocument::new("https://ads.example.com/2", 200, "<html></html>").with_frame(
            ad_frame(
                r#"<a data-asoch-targets="ad0,ochAppName" href="https://www.googleadservices.com/pagead/aclk?adurl=https%3A%2F%2Fplay.google.com%2Fstore%2Fapps%2Fdetails%3Fid%3Dcom.foo.game">Foo Game</a>"#,
            ),
        );

        let result = extractor().extract(&doc, &fields(&[Field::StoreLink, Field::AppName]));

        assert_eq!(result.value(Field::AppName), Some("Foo Game"));
        assert_eq!(
            result.value(Field::StoreLink),
            Some("https://play.google.com/store/apps/details?id=com.foo.game")
        );
        assert_eq!(result.confidence.get(&Field::AppName), Some(&true));
        assert_eq!(result.strategies_run, vec!["structured_data", "anchor"]);
    }

    #[test]
    fn heading_fallback_skips_blacklisted_text() {
        let doc = RenderedDocument::new(
            "https://ads.example.com/3",
            200,
            r#"<body><div role="heading">Sponsored</div><div role="heading">Super Puzzle</div></body>"#,
        );

        let result = extractor().extract(&doc, &fields(&[Field::AppName]));

        assert_eq!(result.value(Field::AppName), Some("Super Puzzle"));
        assert_eq!(result.resolved_by.get(&Field::AppName), Some(&"heading"));
        assert_eq!(result.confidence.get(&Field::AppName), Some(&false));
    }

    #[test]
    fn raw_scan_skips_denied_namespaces() {
        let doc = RenderedDocument::new(
            "https://ads.example.com/4",
            200,
            r#"<script>var a = "https://play.google.com/store/apps/details?id=com.google.android.gms";
               var b = "https://play.google.com/store/apps/details?id=com.real.app";</script>"#,
        );

        let result = extractor().extract(&doc, &fields(&[Field::StoreLink]));

        assert_eq!(
            result.value(Field::StoreLink),
            Some("https://play.google.com/store/apps/details?id=com.real.app")
        );
        assert_eq!(result.resolved_by.get(&Field::StoreLink), Some(&"raw_content"));
    }

    #[test]
    fn degenerate_and_cross_origin_frames_contribute_nothing() {
        let doc = RenderedDocument::new("https://ads.example.com/5", 200, "<body></body>")
            .with_frame(FrameSnapshot::new(
                "https://tpc.googlesyndication.com/pixel",
                1.0,
                1.0,
                Some(r#"<a data-asoch-targets="ochAppName" href="https://play.google.com/store/apps/details?id=com.hidden.app">Hidden</a>"#.into()),
            ))
            .with_frame(FrameSnapshot::new(
                "https://other.example.net/frame",
                300.0,
                250.0,
                None,
            ));

        let result = extractor().extract(&doc, &fields(&[Field::StoreLink, Field::AppName]));

        assert_eq!(result.get(Field::StoreLink), Some(&FieldValue::NotFound));
        assert_eq!(result.get(Field::AppName), Some(&FieldValue::NotFound));
    }

    #[test]
    fn label_falls_back_to_first_tagline_sentence() {
        let doc = RenderedDocument::new(
            "https://ads.example.com/6",
            200,
            r#"<body><div class="app-description">Grow your own farm today. Free to play.</div></body>"#,
        );

        let result = extractor().extract(&doc, &fields(&[Field::AppName, Field::Tagline]));

        assert_eq!(result.value(Field::AppName), Some("Grow your own farm today"));
        assert_eq!(result.resolved_by.get(&Field::AppName), Some(&"tagline_sentence"));
        assert_eq!(result.confidence.get(&Field::AppName), Some(&false));
        assert_eq!(
            result.value(Field::Tagline),
            Some("Grow your own farm today. Free to play.")
        );
    }

    #[test]
    fn tagline_is_not_written_unless_requested() {
        let doc = RenderedDocument::new(
            "https://ads.example.com/7",
            200,
            r#"<body><div class="app-description">Grow your own farm today. Free to play.</div></body>"#,
        );

        let result = extractor().extract(&doc, &fields(&[Field::AppName]));

        assert_eq!(result.value(Field::AppName), Some("Grow your own farm today"));
        assert!(result.get(Field::Tagline).is_none());
    }

    #[test]
    fn missing_fields_become_not_found() {
        let doc = RenderedDocument::new("https://ads.example.com/8", 200, "<body><p>nothing</p></body>");

        let result = extractor().extract(&doc, &fields(&Field::ALL));

        for field in Field::ALL {
            assert_eq!(result.get(field), Some(&FieldValue::NotFound));
        }
        assert_eq!(
            result.strategies_run,
            vec![
                "structured_data",
                "anchor",
                "heading",
                "raw_content",
                "structured_data",
                "anchor",
                "heading",
                "raw_content",
            ]
        );
    }
}
