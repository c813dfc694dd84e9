//! In-page frame walk.

use serde::Deserialize;

use crate::extract::FrameSnapshot;

/// Walks every (i)frame depth-first from the main document and returns a JSON
/// string of `{src, width, height, html, depth}` records. Frames whose
/// document cannot be read report `html: null` and are not descended into.
pub const FRAME_SNAPSHOT_SCRIPT: &str = r#"
(() => {
    const out = [];
    const walk = (doc, depth) => {
        if (depth > 6) return;
        let frames = [];
        try { frames = Array.from(doc.querySelectorAll('iframe, frame')); } catch (e) { return; }
        for (const el of frames) {
            const rect = el.getBoundingClientRect();
            let inner = null;
            try { inner = el.contentDocument; } catch (e) { inner = null; }
            let html = null;
            if (inner && inner.documentElement) {
                try { html = inner.documentElement.outerHTML; } catch (e) { html = null; }
            }
            out.push({
                src: el.src || (inner && inner.URL) || '',
                width: rect.width,
                height: rect.height,
                html: html,
                depth: depth
            });
            if (html !== null) walk(inner, depth + 1);
        }
    };
    walk(document, 1);
    return JSON.stringify(out);
})()
"#;

#[derive(Debug, Deserialize)]
struct FrameRecord {
    #[serde(default)]
    src: String,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    depth: u32,
}

/// Parse the script's output. Malformed output yields no frames.
pub fn parse_snapshot(json: &str) -> Vec<FrameSnapshot> {
    let records: Vec<FrameRecord> = match serde_json::from_str(json) {
        Ok(records) => records,
        Err(e) => {
            tracing::debug!("Unreadable frame snapshot: {}", e);
            return Vec::new();
        }
    };
    records
        .into_iter()
        .map(|r| FrameSnapshot {
            depth: r.depth.max(1),
            ..FrameSnapshot::new(r.src, r.width, r.height, r.html)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_and_hidden_frames() {
        let json = r#"[
            {"src":"https://tpc.googlesyndication.com/x","width":300,"height":250,"html":"<html><body>ad</body></html>","depth":1},
            {"src":"https://other.example/y","width":0,"height":0,"html":null,"depth":2}
        ]"#;
        let frames = parse_snapshot(json);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].html.as_deref(), Some("<html><body>ad</body></html>"));
        assert!(!frames[0].is_degenerate());
        assert_eq!(frames[1].depth, 2);
        assert!(frames[1].html.is_none());
        assert!(frames[1].is_degenerate());
    }

    #[test]
    fn malformed_output_yields_no_frames() {
        assert!(parse_snapshot("undefined").is_empty());
        assert!(parse_snapshot("[]").is_empty());
    }
}
