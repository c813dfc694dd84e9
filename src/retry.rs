//! Bounded per-item retry loop.
//!
//! Each attempt loads the page, checks it for a block, and extracts. Results
//! are merged into a best-so-far across attempts; a block ends the loop at
//! once so the caller can rotate the session.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::block::BlockDetector;
use crate::extract::Extractor;
use crate::model::{ExtractionResult, Field, WorkItem};
use crate::session::{BrowserSession, LoadError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound of the random delay added to every backoff.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_ms() -> u64 {
    750
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let ms = self.base_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(ms.round() as u64)
    }

    fn jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=self.jitter_ms))
    }
}

/// How the attempt loop for one item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Every required field resolved.
    Success,
    /// Attempts ran out with required fields still missing.
    Exhausted,
    /// A block page ended the loop; the session must be rotated.
    Blocked,
    /// The browser died under the item.
    SessionCrash,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub result: ExtractionResult,
    /// Attempts charged to the item so far, including earlier sessions.
    pub attempts: u32,
    pub termination: Termination,
}

/// Where a resumed item left off on a previous session.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub attempts: u32,
    pub best: ExtractionResult,
}

pub struct RetryController {
    config: RetryConfig,
    detector: Arc<BlockDetector>,
    extractor: Arc<dyn Extractor>,
    required: BTreeSet<Field>,
    page_timeout: Duration,
}

impl RetryController {
    pub fn new(
        config: RetryConfig,
        detector: Arc<BlockDetector>,
        extractor: Arc<dyn Extractor>,
        required: BTreeSet<Field>,
        page_timeout: Duration,
    ) -> Self {
        Self {
            config,
            detector,
            extractor,
            required,
            page_timeout,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Required fields for `item`: the run's required set restricted to what the
    /// item still needs, or everything it needs when the two do not overlap.
    pub fn required_for(&self, item: &WorkItem) -> BTreeSet<Field> {
        let required: BTreeSet<Field> = self
            .required
            .intersection(&item.fields_needed)
            .copied()
            .collect();
        if required.is_empty() {
            item.fields_needed.clone()
        } else {
            required
        }
    }

    pub async fn resolve(&self, item: &WorkItem, session: &dyn BrowserSession) -> Resolution {
        self.resume(item, session, Progress::default()).await
    }

    /// Continue an item on `session`, charging attempts against the same bound.
    pub async fn resume(
        &self,
        item: &WorkItem,
        session: &dyn BrowserSession,
        progress: Progress,
    ) -> Resolution {
        let fields = &item.fields_needed;
        let required = self.required_for(item);
        let max_attempts = self.config.max_attempts.max(1);
        let Progress {
            mut attempts,
            mut best,
        } = progress;
        let first_here = attempts;

        while attempts < max_attempts {
            if attempts > first_here {
                let delay = self.config.backoff(attempts) + self.config.jitter();
                debug!("{}: retrying in {:?}", item.key, delay);
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            let doc = match session.load(&item.source_url, self.page_timeout).await {
                Ok(doc) => doc,
                Err(LoadError::SessionCrash(e)) => {
                    warn!("{}: session crashed on attempt {}: {}", item.key, attempts, e);
                    best.merge(ExtractionResult::error(fields));
                    return Resolution {
                        result: best,
                        attempts,
                        termination: Termination::SessionCrash,
                    };
                }
                Err(e) => {
                    debug!("{}: attempt {} failed: {}", item.key, attempts, e);
                    best.merge(ExtractionResult::error(fields));
                    continue;
                }
            };

            let body = doc.body_text();
            if self.detector.is_blocked(doc.status, &body) {
                match self.detector.matched_phrase(&body) {
                    Some(phrase) => {
                        warn!("{}: blocked ({:?}) on attempt {}", item.key, phrase, attempts)
                    }
                    None => warn!(
                        "{}: blocked (HTTP {}) on attempt {}",
                        item.key, doc.status, attempts
                    ),
                }
                best.merge(ExtractionResult::blocked(fields));
                return Resolution {
                    result: best,
                    attempts,
                    termination: Termination::Blocked,
                };
            }

            let result = self.extractor.extract(&doc, fields);
            debug!(
                "{}: attempt {} ran {:?}",
                item.key, attempts, result.strategies_run
            );
            best.merge(result);

            if best.is_complete(&required) {
                return Resolution {
                    result: best,
                    attempts,
                    termination: Termination::Success,
                };
            }
        }

        Resolution {
            result: best,
            attempts,
            termination: Termination::Exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractConfig, FieldExtractor, RenderedDocument};
    use crate::model::{FieldValue, Outcome, RowKey};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Serves queued responses, repeating the last one.
    struct ScriptedBrowser {
        responses: Mutex<VecDeque<Result<RenderedDocument, LoadError>>>,
        loads: AtomicU32,
    }

    impl ScriptedBrowser {
        fn new(responses: Vec<Result<RenderedDocument, LoadError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                loads: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BrowserSession for ScriptedBrowser {
        async fn load(&self, _url: &str, _timeout: Duration) -> Result<RenderedDocument, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let mut queue = self.responses.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            }
        }

        async fn probe(&self, _url: &str, _timeout: Duration) -> Result<(), LoadError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    /// Wraps the real extractor and counts invocations.
    struct CountingExtractor {
        inner: FieldExtractor,
        calls: AtomicU32,
    }

    impl Extractor for CountingExtractor {
        fn extract(&self, doc: &RenderedDocument, fields: &BTreeSet<Field>) -> ExtractionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.extract(doc, fields)
        }
    }

    fn counting() -> Arc<CountingExtractor> {
        Arc::new(CountingExtractor {
            inner: FieldExtractor::new(ExtractConfig::default()),
            calls: AtomicU32::new(0),
        })
    }

    fn controller(extractor: Arc<CountingExtractor>, required: &[Field]) -> RetryController {
        RetryController::new(
            RetryConfig {
                max_attempts: 3,
                base_delay_ms: 100,
                backoff_multiplier: 2.0,
                jitter_ms: 0,
            },
            Arc::new(BlockDetector::default()),
            extractor,
            required.iter().copied().collect(),
            Duration::from_secs(5),
        )
    }

    fn item(fields: &[Field]) -> WorkItem {
        WorkItem::new(
            RowKey::new("Ads", 2),
            "https://adstransparency.example.com/ad/1",
            fields.iter().copied().collect(),
        )
    }

    fn page(html: &str) -> Result<RenderedDocument, LoadError> {
        Ok(RenderedDocument::new(
            "https://adstransparency.example.com/ad/1",
            200,
            html,
        ))
    }

    const FOUND: &str = r#"<body><div role="heading">Farm Story</div>
        <a href="https://play.google.com/store/apps/details?id=com.farm.story">Get</a></body>"#;

    #[test]
    fn backoff_grows_multiplicatively() {
        let config = RetryConfig {
            base_delay_ms: 100,
            backoff_multiplier: 3.0,
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(300));
        assert_eq!(config.backoff(3), Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_stops_at_max_attempts() {
        let extractor = counting();
        let retry = controller(extractor.clone(), &[Field::StoreLink]);
        let browser = ScriptedBrowser::new(vec![page("<body><p>nothing here</p></body>")]);

        let resolution = retry.resolve(&item(&[Field::StoreLink]), &browser).await;

        assert_eq!(resolution.termination, Termination::Exhausted);
        assert_eq!(resolution.attempts, 3);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            resolution.result.get(Field::StoreLink),
            Some(&FieldValue::NotFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn block_page_short_circuits_extraction() {
        let extractor = counting();
        let retry = controller(extractor.clone(), &[Field::StoreLink]);
        let browser = ScriptedBrowser::new(vec![page(
            "<body>Our systems have detected unusual traffic from your computer network.</body>",
        )]);

        let resolution = retry.resolve(&item(&[Field::StoreLink]), &browser).await;

        assert_eq!(resolution.termination, Termination::Blocked);
        assert_eq!(resolution.attempts, 1);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            Outcome::classify(&resolution.result, &retry.required_for(&item(&[Field::StoreLink]))),
            Outcome::Blocked
        );
    }

    #[tokio::test(start_paused = true)]
    async fn status_429_counts_as_block() {
        let extractor = counting();
        let retry = controller(extractor.clone(), &[Field::StoreLink]);
        let browser = ScriptedBrowser::new(vec![Ok(RenderedDocument::new(
            "https://adstransparency.example.com/ad/1",
            429,
            "<body></body>",
        ))]);

        let resolution = retry.resolve(&item(&[Field::StoreLink]), &browser).await;

        assert_eq!(resolution.termination, Termination::Blocked);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retried_then_resolved() {
        let extractor = counting();
        let retry = controller(extractor.clone(), &[Field::StoreLink, Field::AppName]);
        let browser = ScriptedBrowser::new(vec![
            Err(LoadError::Timeout(Duration::from_secs(5))),
            page(FOUND),
        ]);

        let resolution = retry
            .resolve(&item(&[Field::StoreLink, Field::AppName]), &browser)
            .await;

        assert_eq!(resolution.termination, Termination::Success);
        assert_eq!(resolution.attempts, 2);
        assert_eq!(resolution.result.value(Field::AppName), Some("Farm Story"));
        assert_eq!(
            resolution.result.value(Field::StoreLink),
            Some("https://play.google.com/store/apps/details?id=com.farm.story")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn partial_values_survive_later_empty_attempts() {
        let extractor = counting();
        let retry = controller(extractor.clone(), &[Field::StoreLink, Field::AppName]);
        let browser = ScriptedBrowser::new(vec![
            page(r#"<body><div role="heading">Farm Story</div></body>"#),
            page("<body></body>"),
        ]);

        let resolution = retry
            .resolve(&item(&[Field::StoreLink, Field::AppName]), &browser)
            .await;

        assert_eq!(resolution.termination, Termination::Exhausted);
        assert_eq!(resolution.result.value(Field::AppName), Some("Farm Story"));
        assert_eq!(
            resolution.result.get(Field::StoreLink),
            Some(&FieldValue::NotFound)
        );
        assert_eq!(
            Outcome::classify(
                &resolution.result,
                &retry.required_for(&item(&[Field::StoreLink, Field::AppName]))
            ),
            Outcome::Partial
        );
    }

    #[tokio::test(start_paused = true)]
    async fn crash_ends_the_loop() {
        let extractor = counting();
        let retry = controller(extractor.clone(), &[Field::StoreLink]);
        let browser = ScriptedBrowser::new(vec![Err(LoadError::SessionCrash(
            "target closed".into(),
        ))]);

        let resolution = retry.resolve(&item(&[Field::StoreLink]), &browser).await;

        assert_eq!(resolution.termination, Termination::SessionCrash);
        assert_eq!(resolution.attempts, 1);
        assert_eq!(browser.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_item_keeps_its_attempt_count() {
        let extractor = counting();
        let retry = controller(extractor.clone(), &[Field::StoreLink]);
        let browser = ScriptedBrowser::new(vec![page("<body></body>")]);

        let resolution = retry
            .resume(
                &item(&[Field::StoreLink]),
                &browser,
                Progress {
                    attempts: 2,
                    best: ExtractionResult::blocked(&[Field::StoreLink].into_iter().collect()),
                },
            )
            .await;

        assert_eq!(resolution.attempts, 3);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            resolution.result.get(Field::StoreLink),
            Some(&FieldValue::NotFound)
        );
    }
}
