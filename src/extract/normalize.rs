//! Text cleanup and store-link validation.
//!
//! Everything here is pure: the same raw input always produces the same
//! cleaned output or `NOT_FOUND`.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::FieldValue;

/// `{ ... }` rule bodies leaking from inline style blocks.
static CSS_BLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[^{}]*\}").unwrap());

/// Pixel-unit tokens such as `12px` or `-0.5px`.
static PX_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)-?\b\d+(?:\.\d+)?px\b").unwrap());

/// `property: value;` shaped text. The value may not contain spaces, so
/// prose such as "Note: great app; try it" does not match.
static CSS_DECLARATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z-]+\s*:\s*[^\s;{}]*;").unwrap());

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Java-style package identifier (`com.example.app`).
static PACKAGE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)+$").unwrap());

static PLAY_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:https?://)?play\.google\.com/store/apps/details\?(?:[^\s&#]*&)*id=([A-Za-z][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)+)").unwrap()
});

static MARKET_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)market://details\?(?:[^\s&#]*&)*id=([A-Za-z][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)+)")
        .unwrap()
});

static APPLE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:https?://)?(?:apps|itunes)\.apple\.com/(?:[a-z]{2}/)?app/(?:[^/\s?#]+/)?id(\d{5,})").unwrap()
});

/// Code points that render as nothing.
fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{034F}'
            | '\u{061C}'
            | '\u{180E}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{FEFF}'
    ) || (c.is_control() && !c.is_whitespace())
}

/// Remove zero-width and other invisible code points.
pub fn strip_invisible(text: &str) -> String {
    text.chars().filter(|c| !is_invisible(*c)).collect()
}

/// Collapse runs of whitespace to single spaces and trim.
pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Text containing `property: value;` declarations.
pub fn looks_like_css(text: &str) -> bool {
    CSS_DECLARATION.is_match(text)
}

/// Case-insensitive match of `phrase` in `text` on word boundaries.
fn contains_phrase(text: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    let bytes = text.as_bytes();
    text.match_indices(phrase).any(|(start, m)| {
        let end = start + m.len();
        let before_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let after_ok = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
        before_ok && after_ok
    })
}

/// Cleans raw extracted text into a field value.
#[derive(Debug, Clone)]
pub struct Normalizer {
    pub min_len: usize,
    pub max_len: usize,
    /// Lowercased phrases rejected only when they are the whole text.
    pub exact: Vec<String>,
    /// Lowercased phrases rejected anywhere in the text (word-bounded).
    pub contains: Vec<String>,
    /// Text is cut at the first of these markers.
    pub separators: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(2, 80)
    }
}

impl Normalizer {
    pub fn new(min_len: usize, max_len: usize) -> Self {
        Self {
            min_len,
            max_len,
            exact: Vec::new(),
            contains: Vec::new(),
            separators: vec!["|".to_string(), "\u{2022}".to_string(), "\u{00B7}".to_string()],
        }
    }

    pub fn with_blacklist(mut self, exact: &[String], contains: &[String]) -> Self {
        self.exact = exact.iter().map(|p| p.trim().to_lowercase()).collect();
        self.contains = contains.iter().map(|p| p.trim().to_lowercase()).collect();
        self
    }

    pub fn with_separators(mut self, separators: Vec<String>) -> Self {
        self.separators = separators;
        self
    }

    /// Clean `raw`, returning `NOT_FOUND` when the text is unusable.
    pub fn clean(&self, raw: &str) -> FieldValue {
        let text = strip_invisible(raw);
        let text = CSS_BLOCK.replace_all(&text, " ");
        let text = PX_TOKEN.replace_all(&text, "");

        let mut text: &str = &text;
        if let Some(cut) = self
            .separators
            .iter()
            .filter_map(|sep| text.find(sep.as_str()))
            .min()
        {
            text = &text[..cut];
        }
        let text = collapse_whitespace(text);

        let len = text.chars().count();
        if len < self.min_len || len > self.max_len {
            return FieldValue::NotFound;
        }
        if looks_like_css(&text) {
            return FieldValue::NotFound;
        }
        if self.is_blacklisted(&text) {
            return FieldValue::NotFound;
        }

        FieldValue::Value(text)
    }

    pub fn is_blacklisted(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.exact.iter().chain(&self.contains).any(|p| lower == *p)
            || self.contains.iter().any(|p| contains_phrase(&lower, p))
    }
}

/// First sentence of `text`, bounded to `max_len` characters.
///
/// Cut at the first sentence-ending punctuation followed by whitespace or the
/// end of text; an over-long sentence is trimmed back to a word boundary.
pub fn first_sentence(text: &str, max_len: usize) -> Option<String> {
    let text = collapse_whitespace(text);
    let mut end = text.len();
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?' | '\u{3002}') {
            let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
            if at_boundary {
                end = idx;
                break;
            }
        }
    }

    let sentence = text[..end].trim();
    if sentence.is_empty() {
        return None;
    }
    if sentence.chars().count() <= max_len {
        return Some(sentence.to_string());
    }

    let truncated: String = sentence.chars().take(max_len).collect();
    let trimmed = match truncated.rfind(' ') {
        Some(space) if space > 0 => truncated[..space].trim_end(),
        _ => truncated.trim_end(),
    };
    Some(trimmed.to_string())
}

/// Whether `candidate` is a bare package identifier.
pub fn is_package_id(candidate: &str) -> bool {
    PACKAGE_ID.is_match(candidate)
}

/// Canonical Play Store link for a package identifier.
pub fn play_link_for_package(package: &str) -> String {
    format!("https://play.google.com/store/apps/details?id={}", package)
}

/// Find a store destination in `text` and return its canonical link.
///
/// Percent-encoded redirect URLs (`adurl=https%3A%2F%2Fplay...`) are decoded
/// first.
pub fn canonical_store_link(text: &str) -> Option<String> {
    let decoded = urlencoding::decode(text)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| text.to_string());
    let decoded = decoded.replace("\\u003d", "=").replace("\\u0026", "&").replace("\\/", "/");

    if let Some(caps) = PLAY_LINK.captures(&decoded).or_else(|| MARKET_LINK.captures(&decoded)) {
        return Some(play_link_for_package(&caps[1]));
    }
    if let Some(caps) = APPLE_LINK.captures(&decoded) {
        return Some(format!("https://apps.apple.com/app/id{}", &caps[1]));
    }
    None
}

/// Every store destination in `text`, canonicalised, in order of appearance.
pub fn store_links_in(text: &str) -> Vec<String> {
    let decoded = urlencoding::decode(text)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| text.to_string());
    let mut found: Vec<(usize, String)> = PLAY_LINK
        .captures_iter(&decoded)
        .chain(MARKET_LINK.captures_iter(&decoded))
        .filter_map(|caps| {
            let start = caps.get(0)?.start();
            Some((start, play_link_for_package(&caps[1])))
        })
        .chain(APPLE_LINK.captures_iter(&decoded).filter_map(|caps| {
            let start = caps.get(0)?.start();
            Some((start, format!("https://apps.apple.com/app/id{}", &caps[1])))
        }))
        .collect();
    found.sort_by_key(|(start, _)| *start);
    let mut links: Vec<String> = Vec::with_capacity(found.len());
    for (_, link) in found {
        if !links.contains(&link) {
            links.push(link);
        }
    }
    links
}

/// Whether `link` already has a valid canonical store-link shape.
pub fn is_store_link(link: &str) -> bool {
    canonical_store_link(link).is_some_and(|canonical| canonical == link)
}

/// Package identifier of a Play link, if it is one.
pub fn package_of(link: &str) -> Option<String> {
    let decoded = urlencoding::decode(link).ok()?;
    PLAY_LINK
        .captures(&decoded)
        .or_else(|| MARKET_LINK.captures(&decoded))
        .map(|caps| caps[1].to_string())
}
