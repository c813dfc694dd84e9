//! Browser session management.
//!
//! A [`SessionManager`] owns at most one live browser session at a time and
//! decides when it must be replaced: after a configured number of items,
//! after any block, after a crash, or when a periodic health probe fails.

mod fingerprint;

pub use fingerprint::{
    builtin_fingerprints, platform_for, Fingerprint, FingerprintPool, ResourcePolicy,
    CHROMIUM_USER_AGENTS,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::extract::RenderedDocument;

/// Why a single page load failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoadError {
    #[error("page load timed out after {0:?}")]
    Timeout(Duration),
    #[error("browser session crashed: {0}")]
    SessionCrash(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to launch browser session: {0}")]
    Launch(String),
    #[error("browser support not compiled. Rebuild with: cargo build --features browser")]
    Unsupported,
}

/// Everything that distinguishes one session from the next.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    pub proxy: Option<String>,
    pub fingerprint: Fingerprint,
    pub resources: ResourcePolicy,
    /// Extra wait after load for late frames and network to settle.
    pub settle: Duration,
}

/// One live browser context.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate to `url` and snapshot the rendered document and its frames.
    async fn load(&self, url: &str, timeout: Duration) -> Result<RenderedDocument, LoadError>;

    /// Trivial open/close used as a health check.
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), LoadError>;

    async fn close(&self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, profile: &SessionProfile) -> Result<Arc<dyn BrowserSession>, SessionError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Items handled before a session is forcibly replaced.
    #[serde(default = "default_max_items_per_session")]
    pub max_items_per_session: u32,
    /// Post-block cooldown range, in seconds.
    #[serde(default = "default_cooldown_min_secs")]
    pub cooldown_min_secs: u64,
    #[serde(default = "default_cooldown_max_secs")]
    pub cooldown_max_secs: u64,
    /// Proxy endpoints; one is picked uniformly at random per session.
    #[serde(default)]
    pub proxies: Vec<String>,
    /// Fingerprint pool; empty means the built-in pool.
    #[serde(default)]
    pub fingerprints: Vec<Fingerprint>,
    #[serde(default)]
    pub resources: ResourcePolicy,
    #[serde(default = "default_health_probe_url")]
    pub health_probe_url: Option<String>,
    #[serde(default = "default_health_probe_interval_secs")]
    pub health_probe_interval_secs: u64,
    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Remote Chrome DevTools URL (e.g., "ws://localhost:9222").
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub chrome_args: Vec<String>,
}

fn default_max_items_per_session() -> u32 {
    20
}

fn default_cooldown_min_secs() -> u64 {
    30
}

fn default_cooldown_max_secs() -> u64 {
    120
}

fn default_health_probe_url() -> Option<String> {
    Some("about:blank".to_string())
}

fn default_health_probe_interval_secs() -> u64 {
    300
}

fn default_page_timeout_secs() -> u64 {
    30
}

fn default_settle_ms() -> u64 {
    1500
}

fn default_headless() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_items_per_session: default_max_items_per_session(),
            cooldown_min_secs: default_cooldown_min_secs(),
            cooldown_max_secs: default_cooldown_max_secs(),
            proxies: Vec::new(),
            fingerprints: Vec::new(),
            resources: ResourcePolicy::default(),
            health_probe_url: default_health_probe_url(),
            health_probe_interval_secs: default_health_probe_interval_secs(),
            page_timeout_secs: default_page_timeout_secs(),
            settle_ms: default_settle_ms(),
            headless: default_headless(),
            remote_url: None,
            chrome_args: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn cooldown_range(&self) -> (Duration, Duration) {
        let min = self.cooldown_min_secs.min(self.cooldown_max_secs);
        (
            Duration::from_secs(min),
            Duration::from_secs(self.cooldown_max_secs.max(min)),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    /// Items-per-session ceiling reached.
    Ceiling,
    Blocked,
    HealthCheck,
    Crash,
}

impl RotationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ceiling => "ceiling",
            Self::Blocked => "blocked",
            Self::HealthCheck => "health_check",
            Self::Crash => "crash",
        }
    }
}

impl std::fmt::Display for RotationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an item ended, as far as its session is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Completed,
    Blocked,
    Crashed,
}

/// State of the live session. Mutated only by the manager.
pub struct Session {
    pub id: u64,
    pub proxy: Option<String>,
    pub fingerprint: Fingerprint,
    pub items_handled: u32,
    pub created_at: DateTime<Utc>,
    pub healthy: bool,
    last_probe: Instant,
    retire: Option<RotationReason>,
    browser: Arc<dyn BrowserSession>,
}

/// Shared handle to the live session, given to extraction tasks.
#[derive(Clone)]
pub struct SessionLease {
    pub id: u64,
    browser: Arc<dyn BrowserSession>,
}

impl SessionLease {
    pub fn browser(&self) -> &dyn BrowserSession {
        self.browser.as_ref()
    }
}

pub struct SessionManager {
    launcher: Arc<dyn BrowserLauncher>,
    config: SessionConfig,
    fingerprints: FingerprintPool,
    current: Option<Session>,
    next_id: u64,
    rotations: BTreeMap<RotationReason, u32>,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, config: SessionConfig) -> Self {
        let fingerprints = FingerprintPool::new(config.fingerprints.clone());
        Self {
            launcher,
            config,
            fingerprints,
            current: None,
            next_id: 1,
            rotations: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Rotation counts by reason, for the run summary.
    pub fn rotations(&self) -> &BTreeMap<RotationReason, u32> {
        &self.rotations
    }

    /// Rotation the live session is waiting for, if any.
    pub fn pending_rotation(&self) -> Option<RotationReason> {
        self.current.as_ref().and_then(|s| s.retire)
    }

    /// Items the live session may still take before its ceiling.
    pub fn remaining_capacity(&self) -> u32 {
        let max = self.config.max_items_per_session.max(1);
        match &self.current {
            Some(s) if s.retire.is_none() => max.saturating_sub(s.items_handled),
            _ => max,
        }
    }

    /// Hand out the live session, replacing it first if it is retired or unhealthy.
    pub async fn acquire(&mut self) -> Result<SessionLease, SessionError> {
        if let Some(reason) = self.pending_rotation() {
            self.rotate(reason).await;
        }

        if self.probe_due() && !self.probe_current().await {
            self.rotate(RotationReason::HealthCheck).await;
        }

        if self.current.is_none() {
            let session = self.launch().await?;
            self.current = Some(session);
        }

        match &self.current {
            Some(session) => Ok(SessionLease {
                id: session.id,
                browser: session.browser.clone(),
            }),
            None => Err(SessionError::Launch("no session available".to_string())),
        }
    }

    async fn launch(&mut self) -> Result<Session, SessionError> {
        let proxy = self.config.proxies.choose(&mut rand::rng()).cloned();
        let fingerprint = self.fingerprints.draw();
        let profile = SessionProfile {
            proxy: proxy.clone(),
            fingerprint: fingerprint.clone(),
            resources: self.config.resources.clone(),
            settle: Duration::from_millis(self.config.settle_ms),
        };

        let browser = self.launcher.launch(&profile).await?;
        let id = self.next_id;
        self.next_id += 1;

        info!(
            "Started session {} (proxy={}, viewport={}x{})",
            id,
            proxy.as_deref().unwrap_or("none"),
            fingerprint.viewport_width,
            fingerprint.viewport_height
        );

        Ok(Session {
            id,
            proxy,
            fingerprint,
            items_handled: 0,
            created_at: Utc::now(),
            healthy: true,
            last_probe: Instant::now(),
            retire: None,
            browser,
        })
    }

    fn probe_due(&self) -> bool {
        let Some(session) = &self.current else {
            return false;
        };
        self.config.health_probe_url.is_some()
            && session.last_probe.elapsed()
                >= Duration::from_secs(self.config.health_probe_interval_secs)
    }

    async fn probe_current(&mut self) -> bool {
        let Some(url) = self.config.health_probe_url.clone() else {
            return true;
        };
        let timeout = self.config.page_timeout();
        let Some(session) = self.current.as_mut() else {
            return true;
        };

        session.last_probe = Instant::now();
        match session.browser.probe(&url, timeout).await {
            Ok(()) => {
                debug!("Session {} passed health probe", session.id);
                true
            }
            Err(e) => {
                warn!("Session {} failed health probe: {}", session.id, e);
                session.healthy = false;
                false
            }
        }
    }

    /// Record one finished item against the session it ran on.
    ///
    /// Returns the rotation the session now needs, if any.
    pub fn release(&mut self, lease: &SessionLease, signal: SessionSignal) -> Option<RotationReason> {
        let max = self.config.max_items_per_session.max(1);
        let session = self.current.as_mut().filter(|s| s.id == lease.id)?;
        session.items_handled += 1;

        let reason = match signal {
            SessionSignal::Blocked => Some(RotationReason::Blocked),
            SessionSignal::Crashed => {
                session.healthy = false;
                Some(RotationReason::Crash)
            }
            SessionSignal::Completed if session.items_handled >= max => {
                Some(RotationReason::Ceiling)
            }
            SessionSignal::Completed => None,
        };

        session.retire = match (session.retire, reason) {
            (None, r) => r,
            (Some(RotationReason::Ceiling), Some(r)) => Some(r),
            (existing, _) => existing,
        };
        session.retire
    }

    /// Close the live session and count the rotation.
    pub async fn rotate(&mut self, reason: RotationReason) {
        if let Some(session) = self.current.take() {
            info!(
                "Rotating session {} after {} items ({})",
                session.id, session.items_handled, reason
            );
            session.browser.close().await;
            *self.rotations.entry(reason).or_insert(0) += 1;
        }
    }

    /// Close the live session without counting a rotation.
    pub async fn shutdown(&mut self) {
        if let Some(session) = self.current.take() {
            debug!("Closing session {}", session.id);
            session.browser.close().await;
        }
    }
}
