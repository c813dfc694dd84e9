//! Rendered page snapshot handed to the extractor.

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

/// Frames narrower or shorter than this (CSS px) carry no visible content.
pub const MIN_FRAME_EXTENT: f64 = 4.0;

/// Snapshot of one (possibly nested) frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    /// Frame `src` URL as rendered.
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    /// Serialized frame document; `None` when cross-origin rules hid it.
    #[serde(default)]
    pub html: Option<String>,
    /// Nesting depth (1 = direct child of the main document).
    #[serde(default)]
    pub depth: u32,
}

impl FrameSnapshot {
    pub fn new(src: impl Into<String>, width: f64, height: f64, html: Option<String>) -> Self {
        Self {
            src: src.into(),
            width,
            height,
            html,
            depth: 1,
        }
    }

    pub fn host(&self) -> Option<String> {
        Url::parse(&self.src)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
    }

    /// Near-zero viewport: skipped by every strategy.
    pub fn is_degenerate(&self) -> bool {
        self.width < MIN_FRAME_EXTENT || self.height < MIN_FRAME_EXTENT
    }

    /// Whether the frame's host is, or is a subdomain of, one of `hosts`.
    pub fn is_from_any(&self, hosts: &[String]) -> bool {
        let Some(host) = self.host() else {
            return false;
        };
        hosts.iter().any(|h| {
            let h = h.to_lowercase();
            host == h || host.ends_with(&format!(".{}", h))
        })
    }
}

/// A fully rendered page: main document plus frame snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedDocument {
    pub url: String,
    /// HTTP status of the main document response.
    pub status: u16,
    pub html: String,
    pub frames: Vec<FrameSnapshot>,
}

impl RenderedDocument {
    pub fn new(url: impl Into<String>, status: u16, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            html: html.into(),
            frames: Vec::new(),
        }
    }

    pub fn with_frame(mut self, frame: FrameSnapshot) -> Self {
        self.frames.push(frame);
        self
    }

    /// Visible text of the main document body.
    pub fn body_text(&self) -> String {
        let doc = Html::parse_document(&self.html);
        let Ok(body) = Selector::parse("body") else {
            return String::new();
        };
        match doc.select(&body).next() {
            Some(el) => el.text().collect::<Vec<_>>().join(" "),
            None => doc.root_element().text().collect::<Vec<_>>().join(" "),
        }
    }

    /// Readable, non-degenerate frames, ad-serving hosts first.
    ///
    /// Order within each group follows document order.
    pub fn frames_by_priority<'a>(&'a self, ad_hosts: &[String]) -> Vec<&'a FrameSnapshot> {
        let (mut ad, other): (Vec<_>, Vec<_>) = self
            .frames
            .iter()
            .filter(|f| !f.is_degenerate() && f.html.is_some())
            .partition(|f| f.is_from_any(ad_hosts));
        ad.extend(other);
        ad
    }

    /// HTML of the main document followed by every readable frame.
    pub fn all_html(&self) -> Vec<&str> {
        std::iter::once(self.html.as_str())
            .chain(
                self.frames
                    .iter()
                    .filter(|f| !f.is_degenerate())
                    .filter_map(|f| f.html.as_deref()),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<String> {
        vec!["googlesyndication.com".to_string()]
    }

    #[test]
    fn ad_frames_come_first_and_degenerate_frames_are_skipped() {
        let doc = RenderedDocument::new("https://example.com", 200, "<html></html>")
            .with_frame(FrameSnapshot::new(
                "https://cdn.example.com/a",
                300.0,
                250.0,
                Some("<p>other</p>".into()),
            ))
            .with_frame(FrameSnapshot::new(
                "https://tpc.googlesyndication.com/x",
                1.0,
                1.0,
                Some("<p>pixel</p>".into()),
            ))
            .with_frame(FrameSnapshot::new(
                "https://tpc.googlesyndication.com/y",
                320.0,
                50.0,
                Some("<p>ad</p>".into()),
            ))
            .with_frame(FrameSnapshot::new(
                "https://googlesyndication.com/z",
                320.0,
                50.0,
                None,
            ));

        let frames = doc.frames_by_priority(&hosts());
        let srcs: Vec<&str> = frames.iter().map(|f| f.src.as_str()).collect();
        assert_eq!(
            srcs,
            vec!["https://tpc.googlesyndication.com/y", "https://cdn.example.com/a"]
        );
        assert_eq!(doc.all_html().len(), 3);
    }

    #[test]
    fn body_text_ignores_head() {
        let doc = RenderedDocument::new(
            "https://example.com",
            200,
            "<html><head><title>T</title></head><body><p>Hello</p> <p>world</p></body></html>",
        );
        let text = doc.body_text();
        assert!(text.contains("Hello"));
        assert!(!text.contains('T'));
    }

    #[test]
    fn host_matching_accepts_subdomains_only() {
        let frame = FrameSnapshot::new("https://evilgooglesyndication.com/", 10.0, 10.0, None);
        assert!(!frame.is_from_any(&hosts()));
        let frame = FrameSnapshot::new("https://a.googlesyndication.com/", 10.0, 10.0, None);
        assert!(frame.is_from_any(&hosts()));
    }
}
