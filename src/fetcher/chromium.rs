//! Headless Chromium fetcher over the DevTools protocol.
//!
//! One fetcher owns one browser process and navigates one page at a time.
//! Run several in a [`FetcherPool`](super::FetcherPool) for parallelism.
//!
//! # Example
//!
//! ```no_run
//! use scraper_rpc::FetchOptions;
//! use scraper_rpc::fetcher::{ChromiumFetcher, ChromiumOptions, PageFetcher};
//!
//! # async fn example() -> scraper_rpc::Result<()> {
//! let fetcher = ChromiumFetcher::launch(ChromiumOptions::default()).await?;
//! let options = FetchOptions::new().with_wait_for("#content");
//! let html = fetcher.fetch("https://example.com", &options).await;
//! fetcher.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetScriptExecutionDisabledParams;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::FetchOptions;

use super::{FetchError, PageFetcher};

// ============================================================================
// Constants
// ============================================================================

/// Interval between `wait_for` selector polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on page navigation.
const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// ChromiumOptions
// ============================================================================

/// Browser launch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChromiumOptions {
    /// Block images and JavaScript.
    pub disable_resources: bool,
    /// Browser binary; auto-detected when `None`.
    pub executable: Option<PathBuf>,
    /// Pass `--no-sandbox` (needed in most containers).
    pub no_sandbox: bool,
    /// Bound on each navigation.
    pub navigation_timeout: Duration,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            disable_resources: true,
            executable: None,
            no_sandbox: false,
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
        }
    }
}

impl ChromiumOptions {
    /// Enables or disables blocking of images and JavaScript.
    #[inline]
    #[must_use]
    pub fn with_disable_resources(mut self, disable: bool) -> Self {
        self.disable_resources = disable;
        self
    }

    /// Sets the browser binary.
    #[inline]
    #[must_use]
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Enables or disables `--no-sandbox`.
    #[inline]
    #[must_use]
    pub fn with_no_sandbox(mut self, no_sandbox: bool) -> Self {
        self.no_sandbox = no_sandbox;
        self
    }

    /// Sets the navigation bound.
    #[inline]
    #[must_use]
    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }
}

// ============================================================================
// ChromiumFetcher
// ============================================================================

/// A single headless Chromium instance.
pub struct ChromiumFetcher {
    /// Held for the whole navigation; `None` after shutdown.
    browser: Mutex<Option<Browser>>,
    handler: JoinHandle<()>,
    options: ChromiumOptions,
}

impl ChromiumFetcher {
    /// Launches a browser.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the launch settings are rejected
    /// - [`Error::Fetch`] with kind `BrowserError` if the process fails to start
    pub async fn launch(options: ChromiumOptions) -> Result<Self> {
        let mut builder = BrowserConfig::builder();
        if options.disable_resources {
            builder = builder.arg("--blink-settings=imagesEnabled=false");
        }
        if options.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(path) = &options.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(Error::config)?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|e| Error::fetch(FetchError::BROWSER, e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "Browser handler error");
                }
            }
            debug!("Browser handler stopped");
        });

        info!(
            disable_resources = options.disable_resources,
            "Browser launched"
        );

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            handler,
            options,
        })
    }

    async fn render(
        &self,
        page: &Page,
        url: &str,
        options: &FetchOptions,
    ) -> std::result::Result<String, FetchError> {
        if self.options.disable_resources {
            page.execute(SetScriptExecutionDisabledParams::new(true))
                .await
                .map_err(|e| FetchError::browser(e.to_string()))?;
        }

        let limit = self.options.navigation_timeout;
        timeout(limit, page.goto(url))
            .await
            .map_err(|_| {
                FetchError::navigation(format!(
                    "Navigation to {url} timed out after {}s",
                    limit.as_secs()
                ))
            })?
            .map_err(|e| FetchError::navigation(e.to_string()))?;

        if let Some(selector) = options.wait_for() {
            wait_for_selector(page, selector, options.effective_wait_for_timeout()).await?;
        }

        page.content()
            .await
            .map_err(|e| FetchError::browser(e.to_string()))
    }
}

async fn wait_for_selector(
    page: &Page,
    selector: &str,
    limit: Duration,
) -> std::result::Result<(), FetchError> {
    let poll = async {
        loop {
            if page.find_element(selector).await.is_ok() {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
    };

    timeout(limit, poll).await.map_err(|_| {
        FetchError::timeout(format!(
            "Selector '{selector}' not found within {:.1}s",
            limit.as_secs_f64()
        ))
    })
}

fn check_url(url: &str) -> std::result::Result<(), FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::invalid_url(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" | "file" => Ok(()),
        other => Err(FetchError::invalid_url(format!(
            "Unsupported scheme '{other}' in {url}"
        ))),
    }
}

// ============================================================================
// PageFetcher Implementation
// ============================================================================

#[async_trait]
impl PageFetcher for ChromiumFetcher {
    async fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> std::result::Result<String, FetchError> {
        check_url(url)?;

        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| FetchError::browser("Browser is shut down"))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| FetchError::browser(e.to_string()))?;

        let result = self.render(&page, url, options).await;

        if let Err(e) = page.close().await {
            warn!(url = %url, error = %e, "Failed to close page");
        }
        result
    }

    async fn shutdown(&self) {
        let Some(mut browser) = self.browser.lock().await.take() else {
            return;
        };

        if let Err(e) = browser.close().await {
            warn!(error = %e, "Failed to close browser");
        }
        if let Err(e) = browser.wait().await {
            warn!(error = %e, "Failed to reap browser process");
        }
        self.handler.abort();
        info!("Browser closed");
    }
}

impl Drop for ChromiumFetcher {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================
