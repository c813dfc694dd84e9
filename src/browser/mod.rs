//! Chromium-backed browser sessions.
//!
//! Uses chromiumoxide (CDP) with stealth evasion scripts, per-session proxy
//! and fingerprint, and request interception for the resource policy.
//! Building without the `browser` feature leaves a launcher that always
//! reports [`SessionError::Unsupported`].

#[cfg(feature = "browser")]
mod chrome;
mod frames;
mod stealth;

pub use frames::{parse_snapshot, FRAME_SNAPSHOT_SCRIPT};
pub use stealth::{chrome_args, init_script};

#[cfg(feature = "browser")]
pub use chrome::ChromeSession;

use crate::session::SessionConfig;

/// Launches one Chromium instance (or remote connection) per session.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    #[cfg_attr(not(feature = "browser"), allow(dead_code))]
    headless: bool,
    remote_url: Option<String>,
    chrome_args: Vec<String>,
}

impl ChromeLauncher {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            headless: config.headless,
            remote_url: config.remote_url.clone(),
            chrome_args: config.chrome_args.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote_url.is_some()
    }
}

#[cfg(not(feature = "browser"))]
#[async_trait::async_trait]
impl crate::session::BrowserLauncher for ChromeLauncher {
    async fn launch(
        &self,
        _profile: &crate::session::SessionProfile,
    ) -> Result<std::sync::Arc<dyn crate::session::BrowserSession>, crate::session::SessionError> {
        Err(crate::session::SessionError::Unsupported)
    }
}
