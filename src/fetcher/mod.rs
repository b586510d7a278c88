//! Page fetching capability used by the dispatcher.
//!
//! The dispatcher only knows the [`PageFetcher`] trait. Browser handles are
//! owned by fetcher values passed in explicitly, so independent dispatchers
//! (and tests) never share ambient browser state.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `chromium` | Headless Chromium over CDP (feature `chromium`) |
//! | `pool` | Round-robin over several fetchers |

// ============================================================================
// Submodules
// ============================================================================

/// Headless Chromium fetcher.
#[cfg(feature = "chromium")]
pub mod chromium;

/// Fetcher pool.
pub mod pool;

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::FetchOptions;

// ============================================================================
// Re-exports
// ============================================================================

#[cfg(feature = "chromium")]
pub use chromium::{ChromiumFetcher, ChromiumOptions};
pub use pool::FetcherPool;

// ============================================================================
// FetchError
// ============================================================================

/// A navigation or rendering failure.
///
/// Travels to the caller as a failure reply, so `kind` and `message` must be
/// meaningful on their own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct FetchError {
    /// Failure category, e.g. `TimeoutError`.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

impl FetchError {
    /// Kind reported when `wait_for` never matched.
    pub const TIMEOUT: &'static str = "TimeoutError";
    /// Kind reported when the browser could not load the page.
    pub const NAVIGATION: &'static str = "NavigationError";
    /// Kind reported for unusable URLs.
    pub const INVALID_URL: &'static str = "InvalidUrl";
    /// Kind reported when the browser itself failed.
    pub const BROWSER: &'static str = "BrowserError";

    /// Creates an error of any kind.
    #[inline]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Creates a selector timeout error.
    #[inline]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Self::TIMEOUT, message)
    }

    /// Creates a navigation error.
    #[inline]
    pub fn navigation(message: impl Into<String>) -> Self {
        Self::new(Self::NAVIGATION, message)
    }

    /// Creates an invalid URL error.
    #[inline]
    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_URL, message)
    }

    /// Creates a browser error.
    #[inline]
    pub fn browser(message: impl Into<String>) -> Self {
        Self::new(Self::BROWSER, message)
    }

    /// Returns `true` for selector timeouts.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == Self::TIMEOUT
    }
}

// ============================================================================
// PageFetcher
// ============================================================================

/// Navigates to a URL and returns the rendered HTML.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use scraper_rpc::FetchOptions;
/// use scraper_rpc::fetcher::{FetchError, PageFetcher};
///
/// struct Canned;
///
/// #[async_trait]
/// impl PageFetcher for Canned {
///     async fn fetch(&self, _url: &str, _options: &FetchOptions) -> Result<String, FetchError> {
///         Ok("<html></html>".to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetches `url`, honouring `options` such as `wait_for`.
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<String, FetchError>;

    /// Releases browser resources. The default does nothing.
    async fn shutdown(&self) {}
}

// ============================================================================
// Tests
// ============================================================================
