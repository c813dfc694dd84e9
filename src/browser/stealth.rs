//! Evasion scripts and launch arguments applied to every session.

use crate::session::{Fingerprint, SessionProfile};

/// Stealth evasion JavaScript, run before any page script.
/// Based on puppeteer-extra-plugin-stealth techniques.
const STEALTH_SCRIPTS: &[&str] = &[
    // Remove webdriver property
    r#"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined,
        configurable: true
    });
    "#,
    r#"
    window.chrome = window.chrome || {
        runtime: {},
        loadTimes: function() {},
        csi: function() {},
        app: {}
    };
    "#,
    r#"
    if (window.navigator.permissions) {
        const originalQuery = window.navigator.permissions.query;
        window.navigator.permissions.query = (parameters) => (
            parameters.name === 'notifications' ?
            Promise.resolve({ state: Notification.permission }) :
            originalQuery(parameters)
        );
    }
    "#,
    // Look like regular Chrome
    r#"
    Object.defineProperty(navigator, 'plugins', {
        get: () => [
            { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
            { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '' },
            { name: 'Native Client', filename: 'internal-nacl-plugin', description: '' }
        ],
        configurable: true
    });
    "#,
    r#"
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Array;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Promise;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Symbol;
    "#,
    // WebGL vendor/renderer
    r#"
    if (window.WebGLRenderingContext) {
        const getParameter = WebGLRenderingContext.prototype.getParameter;
        WebGLRenderingContext.prototype.getParameter = function(parameter) {
            if (parameter === 37445) {
                return 'Intel Inc.';
            }
            if (parameter === 37446) {
                return 'Intel Iris OpenGL Engine';
            }
            return getParameter.call(this, parameter);
        };
    }
    "#,
];

/// One script for `Page.addScriptToEvaluateOnNewDocument`: the evasions
/// followed by the fingerprint's navigator overrides. Each part runs in its
/// own `try` so one failing override does not skip the rest.
pub fn init_script(fingerprint: &Fingerprint) -> String {
    let navigator = fingerprint.navigator_script();
    STEALTH_SCRIPTS
        .iter()
        .copied()
        .chain(std::iter::once(navigator.as_str()))
        .map(|script| format!("try {{ {} }} catch (e) {{}}", script.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Chrome command-line arguments for a session.
pub fn chrome_args(profile: &SessionProfile, extra: &[String]) -> Vec<String> {
    let fp = &profile.fingerprint;
    let mut args: Vec<String> = [
        "--disable-blink-features=AutomationControlled",
        "--disable-infobars",
        "--disable-dev-shm-usage",
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-background-networking",
        "--disable-sync",
        "--disable-translate",
        "--metrics-recording-only",
        "--safebrowsing-disable-auto-update",
        "--no-sandbox",
        "--disable-gpu",
        "--disable-software-rasterizer",
        // Keep ad frames in-process so their documents can be read.
        "--disable-web-security",
        "--disable-site-isolation-trials",
        "--disable-features=IsolateOrigins,site-per-process",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push(format!("--window-size={},{}", fp.viewport_width, fp.viewport_height));
    if let Some(lang) = fp.languages.first() {
        args.push(format!("--lang={}", lang));
    }
    if let Some(proxy) = &profile.proxy {
        args.push(format!("--proxy-server={}", proxy));
    }
    args.extend(extra.iter().cloned());
    args
}
