//! CDP implementation of [`BrowserLauncher`] and [`BrowserSession`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    self, ErrorReason, EventResponseReceived, ResourceType, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{chrome_args, init_script, parse_snapshot, ChromeLauncher, FRAME_SNAPSHOT_SCRIPT};
use crate::extract::RenderedDocument;
use crate::session::{BrowserLauncher, BrowserSession, LoadError, SessionError, SessionProfile};

const CHROME_PATHS: &[&str] = &[
    // Linux
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    // macOS
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

/// How long to wait for the main document's response after navigation.
const STATUS_WAIT: Duration = Duration::from_secs(2);

static PROFILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Find a Chrome executable in the usual places, then on `PATH`.
fn find_chrome() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROME_PATH") {
        let p = PathBuf::from(shellexpand::tilde(&path).into_owned());
        if p.exists() {
            return Ok(p);
        }
        warn!("CHROME_PATH {} does not exist; searching defaults", path);
    }

    for path in CHROME_PATHS {
        let p = Path::new(path);
        if p.exists() {
            debug!("Found Chrome at: {}", path);
            return Ok(p.to_path_buf());
        }
    }

    for cmd in [
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
    ] {
        if let Ok(path) = which::which(cmd) {
            debug!("Found Chrome in PATH: {}", path.display());
            return Ok(path);
        }
    }

    Err(anyhow::anyhow!(
        "Chrome/Chromium not found. Install it or set CHROME_PATH:\n\
         - Ubuntu/Debian: sudo apt install chromium-browser\n\
         - Fedora: sudo dnf install chromium\n\
         - Or download from: https://www.google.com/chrome/"
    ))
}

/// Resolve the DevTools websocket of a running browser.
async fn remote_ws_url(url: &str) -> Result<String> {
    if url.starts_with("ws") && url.contains("/devtools/") {
        return Ok(url.to_string());
    }
    let http_url = url
        .replace("ws://", "http://")
        .replace("wss://", "https://");
    let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

    let resp: serde_json::Value = reqwest::Client::new()
        .get(&version_url)
        .send()
        .await
        .context("Failed to connect to remote browser")?
        .json()
        .await
        .context("Failed to parse browser version info")?;

    resp.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("No webSocketDebuggerUrl in response"))
}

/// Drive the CDP handler until the connection ends, then flag the session.
fn spawn_handler(mut handler: chromiumoxide::Handler, crashed: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if let Err(e) = h {
                debug!("Browser handler stopped: {}", e);
                break;
            }
        }
        crashed.store(true, Ordering::SeqCst);
    })
}

impl ChromeLauncher {
    async fn start(&self, profile: &SessionProfile) -> Result<ChromeSession> {
        let crashed = Arc::new(AtomicBool::new(false));

        if let Some(remote_url) = &self.remote_url {
            if profile.proxy.is_some() {
                warn!("Proxy rotation has no effect on a remote browser");
            }
            info!("Connecting to remote browser at {}", remote_url);
            let ws_url = remote_ws_url(remote_url).await?;
            let (browser, handler) = Browser::connect(ws_url)
                .await
                .context("Failed to connect to remote browser")?;
            let handler = spawn_handler(handler, crashed.clone());
            return Ok(ChromeSession::new(browser, handler, crashed, profile.clone(), None));
        }

        let chrome_path = find_chrome()?;
        let user_data_dir = std::env::temp_dir().join(format!(
            "adharvest-{}-{}",
            std::process::id(),
            PROFILE_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));

        info!(
            "Launching browser (headless={}, proxy={})",
            self.headless,
            profile.proxy.as_deref().unwrap_or("none")
        );

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(&user_data_dir);
        // with_head means NOT headless
        if !self.headless {
            builder = builder.with_head();
        }
        for arg in chrome_args(profile, &self.chrome_args) {
            builder = builder.arg(arg);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;
        let handler = spawn_handler(handler, crashed.clone());

        Ok(ChromeSession::new(
            browser,
            handler,
            crashed,
            profile.clone(),
            Some(user_data_dir),
        ))
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, profile: &SessionProfile) -> Result<Arc<dyn BrowserSession>, SessionError> {
        let session = self
            .start(profile)
            .await
            .map_err(|e| SessionError::Launch(format!("{:#}", e)))?;
        Ok(Arc::new(session))
    }
}

/// Aborts helper tasks when a page load ends, however it ends.
struct TaskGuard(Vec<JoinHandle<()>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// One live browser with the profile it was launched under.
pub struct ChromeSession {
    browser: RwLock<Option<Browser>>,
    handler: JoinHandle<()>,
    crashed: Arc<AtomicBool>,
    profile: SessionProfile,
    /// Set for launched browsers; remote ones are left running on close.
    user_data_dir: Option<PathBuf>,
}

impl ChromeSession {
    fn new(
        browser: Browser,
        handler: JoinHandle<()>,
        crashed: Arc<AtomicBool>,
        profile: SessionProfile,
        user_data_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            browser: RwLock::new(Some(browser)),
            handler,
            crashed,
            profile,
            user_data_dir,
        }
    }

    fn classify(&self, error: CdpError) -> LoadError {
        if self.crashed.load(Ordering::SeqCst) {
            return LoadError::SessionCrash(error.to_string());
        }
        match error {
            CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse => {
                LoadError::SessionCrash(error.to_string())
            }
            other => LoadError::Navigation(other.to_string()),
        }
    }

    /// Apply the fingerprint and evasions before the page loads anything.
    async fn prepare(&self, page: &Page) -> Result<(), CdpError> {
        let fp = &self.profile.fingerprint;

        match SetUserAgentOverrideParams::builder()
            .user_agent(fp.user_agent.clone())
            .accept_language(fp.accept_language())
            .platform(fp.platform().to_string())
            .build()
        {
            Ok(params) => {
                page.execute(params).await?;
            }
            Err(e) => warn!("Skipping user agent override: {}", e),
        }

        page.execute(SetDeviceMetricsOverrideParams::new(
            fp.viewport_width as i64,
            fp.viewport_height as i64,
            fp.device_scale_factor,
            fp.mobile,
        ))
        .await?;

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(init_script(fp)))
            .await?;
        page.execute(network::EnableParams::default()).await?;
        Ok(())
    }

    /// Drop requests the resource policy rejects; let the rest continue.
    async fn intercept(&self, page: &Page) -> Result<Option<JoinHandle<()>>, CdpError> {
        if self.profile.resources.is_noop() {
            return Ok(None);
        }
        let mut paused = page.event_listener::<EventRequestPaused>().await?;
        page.execute(fetch::EnableParams::default()).await?;

        let policy = self.profile.resources.clone();
        let page = page.clone();
        Ok(Some(tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let kind: &str = event.resource_type.as_ref();
                let outcome = if policy.should_block(kind, &event.request.url) {
                    page.execute(FailRequestParams::new(
                        event.request_id.clone(),
                        ErrorReason::BlockedByClient,
                    ))
                    .await
                    .map(|_| ())
                } else {
                    page.execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                };
                if let Err(e) = outcome {
                    debug!("Request interception stopped: {}", e);
                    break;
                }
            }
        })))
    }

    /// Report the status of the first document response.
    async fn capture_status(
        &self,
        page: &Page,
    ) -> Result<(JoinHandle<()>, oneshot::Receiver<u16>), CdpError> {
        let mut responses = page.event_listener::<EventResponseReceived>().await?;
        let (status_tx, status_rx) = oneshot::channel::<u16>();
        let task = tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                if event.r#type == ResourceType::Document {
                    debug!(
                        "Captured HTTP status {} for {}",
                        event.response.status, event.response.url
                    );
                    let _ = status_tx.send(event.response.status as u16);
                    break;
                }
            }
        });
        Ok((task, status_rx))
    }

    async fn load_inner(
        &self,
        page: &Page,
        url: &str,
        timeout: Duration,
    ) -> Result<RenderedDocument, LoadError> {
        self.prepare(page).await.map_err(|e| self.classify(e))?;

        let mut tasks = TaskGuard(Vec::new());
        if let Some(task) = self.intercept(page).await.map_err(|e| self.classify(e))? {
            tasks.0.push(task);
        }
        let (status_task, status_rx) = self.capture_status(page).await.map_err(|e| self.classify(e))?;
        tasks.0.push(status_task);

        let nav_params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| LoadError::Navigation(format!("invalid URL {}: {}", url, e)))?;

        debug!("Navigating to {}", url);
        let navigation = async {
            let response = page.execute(nav_params).await?;
            if let Some(error) = response.result.error_text.clone() {
                return Ok(Some(error));
            }
            page.wait_for_navigation().await?;
            Ok::<_, CdpError>(None)
        };
        match tokio::time::timeout(timeout, navigation).await {
            Err(_) => return Err(LoadError::Timeout(timeout)),
            Ok(Err(e)) => return Err(self.classify(e)),
            Ok(Ok(Some(error))) => {
                return Err(LoadError::Navigation(format!("{} ({})", error, url)))
            }
            Ok(Ok(None)) => {}
        }

        if !self.profile.settle.is_zero() {
            tokio::time::sleep(self.profile.settle).await;
        }

        let status = match tokio::time::timeout(STATUS_WAIT, status_rx).await {
            Ok(Ok(status)) => status,
            _ => {
                debug!("No document response seen for {}; assuming 200", url);
                200
            }
        };

        let frames = match page.evaluate(FRAME_SNAPSHOT_SCRIPT).await {
            Ok(result) => match result.into_value::<String>() {
                Ok(json) => parse_snapshot(&json),
                Err(e) => {
                    debug!("Frame snapshot returned no JSON: {}", e);
                    Vec::new()
                }
            },
            Err(e) if self.crashed.load(Ordering::SeqCst) => return Err(self.classify(e)),
            Err(e) => {
                debug!("Frame snapshot failed for {}: {}", url, e);
                Vec::new()
            }
        };

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());
        let html = page.content().await.map_err(|e| self.classify(e))?;

        debug!("Loaded {} ({} bytes, {} frames)", final_url, html.len(), frames.len());
        let mut document = RenderedDocument::new(final_url, status, html);
        document.frames = frames;
        Ok(document)
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn load(&self, url: &str, timeout: Duration) -> Result<RenderedDocument, LoadError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(LoadError::SessionCrash("browser connection closed".into()));
        }
        let guard = self.browser.read().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| LoadError::SessionCrash("session already closed".into()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| self.classify(e))?;
        let result = self.load_inner(&page, url, timeout).await;
        let _ = page.close().await;
        result
    }

    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), LoadError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(LoadError::SessionCrash("browser connection closed".into()));
        }
        let guard = self.browser.read().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| LoadError::SessionCrash("session already closed".into()))?;

        let page = tokio::time::timeout(timeout, browser.new_page(url))
            .await
            .map_err(|_| LoadError::Timeout(timeout))?
            .map_err(|e| self.classify(e))?;
        let _ = page.close().await;
        Ok(())
    }

    async fn close(&self) {
        let browser = self.browser.write().await.take();
        if let Some(mut browser) = browser {
            if self.user_data_dir.is_some() {
                if let Err(e) = browser.close().await {
                    debug!("Browser close failed: {}", e);
                }
                let _ = browser.wait().await;
            }
        }
        self.handler.abort();
        if let Some(dir) = &self.user_data_dir {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }
}
