//! Soft-block detection for rendered pages.
//!
//! Runs once per page load, before any extraction work.

use serde::{Deserialize, Serialize};

/// Phrases that mark a CAPTCHA, rate-limit banner or denial page.
pub const DEFAULT_BLOCK_PHRASES: &[&str] = &[
    "unusual traffic",
    "captcha",
    "are you a robot",
    "not a robot",
    "too many requests",
    "rate limit exceeded",
    "access denied",
    "automated queries",
    "verify you are human",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Phrases added to the built-in set.
    #[serde(default)]
    pub extra_phrases: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BlockDetector {
    phrases: Vec<String>,
}

impl Default for BlockDetector {
    fn default() -> Self {
        Self::new(&BlockConfig::default())
    }
}

impl BlockDetector {
    pub fn new(config: &BlockConfig) -> Self {
        let phrases = DEFAULT_BLOCK_PHRASES
            .iter()
            .map(|p| p.to_string())
            .chain(config.extra_phrases.iter().map(|p| p.trim().to_lowercase()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { phrases }
    }

    /// Check if a status code is definitely a block.
    pub fn is_block_status(status: u16) -> bool {
        status == 429
    }

    /// The first block phrase found in `body`, case-insensitively.
    pub fn matched_phrase(&self, body: &str) -> Option<&str> {
        let lower = body.to_lowercase();
        self.phrases
            .iter()
            .find(|p| lower.contains(p.as_str()))
            .map(|p| p.as_str())
    }

    pub fn is_blocked(&self, status: u16, body: &str) -> bool {
        Self::is_block_status(status) || self.matched_phrase(body).is_some()
    }
}
