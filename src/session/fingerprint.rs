//! Browser fingerprints and sub-resource blocking policy.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Real Chromium user agents; sessions run on Chromium so other engines are left out.
pub const CHROMIUM_USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Chrome on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Edge on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36 Edg/130.0.0.0",
];

/// Desktop viewports common enough not to stand out.
const VIEWPORTS: &[(u32, u32)] = &[(1920, 1080), (1536, 864), (1440, 900), (1366, 768), (1280, 800)];

/// What a session presents to pages: user agent, viewport and navigator properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,
    #[serde(default = "default_scale_factor")]
    pub device_scale_factor: f64,
    #[serde(default)]
    pub mobile: bool,
    /// `navigator.platform`; derived from the user agent when empty.
    #[serde(default)]
    pub platform: String,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_hardware_concurrency")]
    pub hardware_concurrency: u32,
}

fn default_viewport_width() -> u32 {
    1366
}

fn default_viewport_height() -> u32 {
    768
}

fn default_scale_factor() -> f64 {
    1.0
}

fn default_languages() -> Vec<String> {
    vec!["en-US".to_string(), "en".to_string()]
}

fn default_hardware_concurrency() -> u32 {
    8
}

/// `navigator.platform` value matching a user agent.
pub fn platform_for(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "Win32"
    } else if user_agent.contains("Macintosh") {
        "MacIntel"
    } else {
        "Linux x86_64"
    }
}

impl Fingerprint {
    pub fn new(user_agent: impl Into<String>, viewport_width: u32, viewport_height: u32) -> Self {
        let user_agent = user_agent.into();
        let platform = platform_for(&user_agent).to_string();
        Self {
            user_agent,
            viewport_width,
            viewport_height,
            device_scale_factor: default_scale_factor(),
            mobile: false,
            platform,
            languages: default_languages(),
            hardware_concurrency: default_hardware_concurrency(),
        }
    }

    pub fn platform(&self) -> &str {
        if self.platform.is_empty() {
            platform_for(&self.user_agent)
        } else {
            &self.platform
        }
    }

    /// `Accept-Language` header value for the configured languages.
    pub fn accept_language(&self) -> String {
        self.languages
            .iter()
            .enumerate()
            .map(|(i, lang)| {
                if i == 0 {
                    lang.clone()
                } else {
                    format!("{};q={:.1}", lang, (10 - i.min(9)) as f64 / 10.0)
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Script overriding navigator properties to agree with this fingerprint.
    pub fn navigator_script(&self) -> String {
        let platform = serde_json::to_string(self.platform()).unwrap_or_else(|_| "\"\"".into());
        let languages = serde_json::to_string(&self.languages).unwrap_or_else(|_| "[]".into());
        format!(
            r#"
            Object.defineProperty(navigator, 'platform', {{ get: () => {platform}, configurable: true }});
            Object.defineProperty(navigator, 'languages', {{ get: () => {languages}, configurable: true }});
            Object.defineProperty(navigator, 'hardwareConcurrency', {{ get: () => {cores}, configurable: true }});
            Object.defineProperty(screen, 'width', {{ get: () => {width}, configurable: true }});
            Object.defineProperty(screen, 'height', {{ get: () => {height}, configurable: true }});
            "#,
            cores = self.hardware_concurrency,
            width = self.viewport_width,
            height = self.viewport_height,
        )
    }
}

/// Built-in fingerprints: every user agent paired with a viewport.
pub fn builtin_fingerprints() -> Vec<Fingerprint> {
    CHROMIUM_USER_AGENTS
        .iter()
        .enumerate()
        .map(|(i, ua)| {
            let (w, h) = VIEWPORTS[i % VIEWPORTS.len()];
            Fingerprint::new(*ua, w, h)
        })
        .collect()
}

/// Draws fingerprints so consecutive sessions never share one.
#[derive(Debug, Clone)]
pub struct FingerprintPool {
    entries: Vec<Fingerprint>,
    last: Option<usize>,
}

impl FingerprintPool {
    /// An empty list falls back to the built-in pool.
    pub fn new(entries: Vec<Fingerprint>) -> Self {
        let entries = if entries.is_empty() {
            builtin_fingerprints()
        } else {
            entries
        };
        Self {
            entries,
            last: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn draw(&mut self) -> Fingerprint {
        let len = self.entries.len();
        let mut idx = rand::rng().random_range(0..len);
        if len > 1 && Some(idx) == self.last {
            idx = (idx + 1 + rand::rng().random_range(0..len - 1)) % len;
        }
        self.last = Some(idx);
        self.entries[idx].clone()
    }
}

/// Which sub-resource requests a session drops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// CDP resource types (`Image`, `Font`, `Media`, ...).
    #[serde(default = "default_blocked_types")]
    pub blocked_types: Vec<String>,
    /// URL substrings of analytics beacons and trackers.
    #[serde(default = "default_blocked_url_patterns")]
    pub blocked_url_patterns: Vec<String>,
}

fn default_blocked_types() -> Vec<String> {
    ["Image", "Font", "Media"].iter().map(|s| s.to_string()).collect()
}

fn default_blocked_url_patterns() -> Vec<String> {
    [
        "google-analytics.com",
        "googletagmanager.com",
        "/pagead/viewthroughconversion",
        "/pagead/1p-user-list",
        "/activeview",
        "facebook.com/tr",
        "/collect?",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            blocked_types: default_blocked_types(),
            blocked_url_patterns: default_blocked_url_patterns(),
        }
    }
}

impl ResourcePolicy {
    /// Documents (including frames) are always let through.
    pub fn should_block(&self, resource_type: &str, url: &str) -> bool {
        if resource_type.eq_ignore_ascii_case("document") {
            return false;
        }
        self.blocked_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(resource_type))
            || self
                .blocked_url_patterns
                .iter()
                .any(|p| url.contains(p.as_str()))
    }

    pub fn is_noop(&self) -> bool {
        self.blocked_types.is_empty() && self.blocked_url_patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_draws_differ() {
        let mut pool = FingerprintPool::new(Vec::new());
        assert!(pool.len() > 1);
        let mut previous = pool.draw();
        for _ in 0..50 {
            let next = pool.draw();
            assert_ne!(next, previous);
            previous = next;
        }
    }

    #[test]
    fn single_entry_pool_repeats() {
        let fp = Fingerprint::new("Mozilla/5.0 (X11; Linux x86_64)", 800, 600);
        let mut pool = FingerprintPool::new(vec![fp.clone()]);
        assert_eq!(pool.draw(), fp);
        assert_eq!(pool.draw(), fp);
    }

    #[test]
    fn platform_follows_user_agent() {
        let pool = builtin_fingerprints();
        assert_eq!(pool[0].platform(), "Win32");
        assert_eq!(pool[2].platform(), "MacIntel");
        assert!(pool[2].navigator_script().contains("\"MacIntel\""));
    }

    #[test]
    fn accept_language_weights_secondary_languages() {
        let fp = Fingerprint::new(CHROMIUM_USER_AGENTS[0], 1366, 768);
        assert_eq!(fp.accept_language(), "en-US,en;q=0.9");
    }

    #[test]
    fn policy_drops_images_and_beacons_but_never_documents() {
        let policy = ResourcePolicy::default();
        assert!(policy.should_block("Image", "https://tpc.googlesyndication.com/a.png"));
        assert!(policy.should_block("Script", "https://www.googletagmanager.com/gtag/js"));
        assert!(!policy.should_block("Script", "https://tpc.googlesyndication.com/sodar.js"));
        assert!(!policy.should_block("Document", "https://www.google-analytics.com/frame"));
    }
}
