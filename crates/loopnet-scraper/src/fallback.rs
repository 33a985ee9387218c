//! Real-browser fallback for pages guarded by a JavaScript challenge.
//!
//! Defines the `FallbackExecutor` capability and its Chromium implementation
//! (via chromiumoxide). The browser is launched lazily on the first
//! escalation and kept for the life of the process.

use crate::challenge::ChallengeDetector;
use crate::error::RenderError;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Pages shorter than this keep being polled while the challenge resolves.
const MIN_RESOLVED_LEN: usize = 1_000;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Final page content produced by a browser render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedPage {
    /// The URL the browser ended on.
    pub final_url: String,
    /// Full page HTML.
    pub body: String,
}

/// Renders a page in a real browser engine.
#[async_trait]
pub trait FallbackExecutor: Send + Sync {
    /// Load `url` and return the final page HTML.
    async fn render(
        &self,
        url: &str,
        headless: bool,
        timeout: Duration,
    ) -> Result<RenderedPage, RenderError>;

    /// Shut the browser down.
    async fn close(&self) {}
}

/// Executor used when no browser is available or the fallback is turned off.
pub struct DisabledExecutor;

#[async_trait]
impl FallbackExecutor for DisabledExecutor {
    async fn render(
        &self,
        _url: &str,
        _headless: bool,
        _timeout: Duration,
    ) -> Result<RenderedPage, RenderError> {
        Err(RenderError::Disabled)
    }
}

const CHROMIUM_BINARIES: [&str; 4] = [
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

const MACOS_APPS: [&str; 2] = [
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

/// Locate a Chromium-family browser on `PATH`, then in the macOS app folder.
pub fn find_chromium() -> Option<PathBuf> {
    CHROMIUM_BINARIES
        .iter()
        .find_map(|name| which::which(name).ok())
        .or_else(|| {
            cfg!(target_os = "macos")
                .then(|| MACOS_APPS.iter().map(PathBuf::from).find(|p| p.exists()))
                .flatten()
        })
}

struct LaunchedBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
    headless: bool,
}

impl LaunchedBrowser {
    async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::warn!("failed to close Chromium cleanly: {e}");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

/// A running browser is reused only when it was launched in the requested mode.
fn needs_launch(running: Option<bool>, headless: bool) -> bool {
    running != Some(headless)
}

/// Chromium-backed fallback executor.
///
/// The browser is kept between renders and relaunched when a render asks
/// for a different headless mode.
pub struct ChromiumExecutor {
    chrome_path: Option<PathBuf>,
    /// How long to keep polling for the challenge to resolve.
    challenge_wait: Duration,
    detector: ChallengeDetector,
    browser: Mutex<Option<LaunchedBrowser>>,
}

impl ChromiumExecutor {
    pub fn new(challenge_wait: Duration, detector: ChallengeDetector) -> Self {
        Self {
            chrome_path: None,
            challenge_wait,
            detector,
            browser: Mutex::new(None),
        }
    }

    /// Use an explicit browser binary instead of searching for one.
    pub fn with_chrome_path(mut self, path: PathBuf) -> Self {
        self.chrome_path = Some(path);
        self
    }

    async fn launch(&self, headless: bool) -> Result<LaunchedBrowser, RenderError> {
        let chrome_path = self
            .chrome_path
            .clone()
            .or_else(find_chromium)
            .ok_or_else(|| {
                RenderError::Unavailable(
                    "Chromium not found on PATH; set LOOPNET_CHROMIUM_PATH".to_string(),
                )
            })?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-blink-features=AutomationControlled");
        builder = if headless {
            builder.arg("--headless=new")
        } else {
            builder.with_head()
        };
        let config = builder
            .build()
            .map_err(|e| RenderError::Unavailable(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::Unavailable(format!("failed to launch Chromium: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        tracing::info!("launched Chromium for challenge fallback (headless={headless})");
        Ok(LaunchedBrowser {
            browser,
            handler,
            headless,
        })
    }

    async fn open_page(&self, url: &str, headless: bool) -> Result<Page, RenderError> {
        let mut guard = self.browser.lock().await;
        if needs_launch(guard.as_ref().map(|b| b.headless), headless) {
            if let Some(previous) = guard.take() {
                tracing::info!("relaunching Chromium (headless={headless})");
                previous.shutdown().await;
            }
            *guard = Some(self.launch(headless).await?);
        }
        let launched = guard
            .as_ref()
            .ok_or_else(|| RenderError::Unavailable("browser not running".to_string()))?;
        launched
            .browser
            .new_page(url)
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))
    }

    /// Poll the page until the challenge clears or `challenge_wait` runs out.
    async fn wait_for_content(&self, page: &Page) -> Result<String, RenderError> {
        let _ = page.wait_for_navigation().await;

        let deadline = Instant::now() + self.challenge_wait;
        let mut html = String::new();
        while Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            html = page_html(page).await?;
            if !self.detector.is_challenge_page(&html) && html.len() > MIN_RESOLVED_LEN {
                break;
            }
        }
        if html.is_empty() {
            html = page_html(page).await?;
        }

        if self.detector.is_challenge_page(&html) {
            return Err(RenderError::ChallengePersisted);
        }
        Ok(html)
    }
}

async fn page_html(page: &Page) -> Result<String, RenderError> {
    page.evaluate("document.documentElement.outerHTML")
        .await
        .map_err(|e| RenderError::Navigation(format!("failed to get HTML: {e}")))?
        .into_value::<String>()
        .map_err(|e| RenderError::Navigation(format!("failed to convert HTML result: {e:?}")))
}

#[async_trait]
impl FallbackExecutor for ChromiumExecutor {
    async fn render(
        &self,
        url: &str,
        headless: bool,
        timeout: Duration,
    ) -> Result<RenderedPage, RenderError> {
        let timeout_ms = timeout.as_millis() as u64;
        let page = tokio::time::timeout(timeout, self.open_page(url, headless))
            .await
            .map_err(|_| RenderError::Timeout(timeout_ms))??;

        let body = tokio::time::timeout(timeout, self.wait_for_content(&page))
            .await
            .map_err(|_| RenderError::Timeout(timeout_ms))
            .and_then(|r| r);

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .map(|u| u.to_string())
            .unwrap_or_else(|| url.to_string());
        let _ = page.close().await;

        Ok(RenderedPage {
            final_url,
            body: body?,
        })
    }

    async fn close(&self) {
        if let Some(launched) = self.browser.lock().await.take() {
            launched.shutdown().await;
            tracing::debug!("Chromium fallback shut down");
        }
    }
}
