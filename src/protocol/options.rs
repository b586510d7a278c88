//! Fetch options forwarded from caller to page fetcher.
//!
//! The protocol treats options as an opaque JSON object: it never validates
//! option semantics, it only guarantees the structure survives the wire.
//! Typed accessors exist for the options the fetcher recognizes.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use scraper_rpc::FetchOptions;
//!
//! let options = FetchOptions::new()
//!     .with_wait_for(".content")
//!     .with_wait_for_timeout(Duration::from_secs(2));
//!
//! assert_eq!(options.wait_for(), Some(".content"));
//! assert_eq!(options.wait_for_timeout(), Some(Duration::from_secs(2)));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Constants
// ============================================================================

/// Option key: CSS selector that must appear before content is extracted.
pub const WAIT_FOR: &str = "wait_for";

/// Option key: bound on the `wait_for` wait, in seconds.
pub const WAIT_FOR_TIMEOUT: &str = "wait_for_timeout";

/// Wait bound used when `wait_for` is set without `wait_for_timeout`.
pub const DEFAULT_WAIT_FOR_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// FetchOptions
// ============================================================================

/// Free-form key/value configuration for one fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchOptions(Map<String, Value>);

// ============================================================================
// Constructors
// ============================================================================

impl FetchOptions {
    /// Creates an empty options map.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps an existing JSON object.
    #[inline]
    #[must_use]
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Map<String, Value>> for FetchOptions {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for FetchOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl FetchOptions {
    /// Sets an arbitrary option.
    #[inline]
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Sets the selector to wait for.
    #[inline]
    #[must_use]
    pub fn with_wait_for(self, selector: impl Into<String>) -> Self {
        self.with(WAIT_FOR, selector.into())
    }

    /// Sets the bound on the selector wait.
    ///
    /// Whole seconds are sent as integers, anything finer as a float.
    #[inline]
    #[must_use]
    pub fn with_wait_for_timeout(self, timeout: Duration) -> Self {
        if timeout.subsec_nanos() == 0 {
            self.with(WAIT_FOR_TIMEOUT, timeout.as_secs())
        } else {
            self.with(WAIT_FOR_TIMEOUT, timeout.as_secs_f64())
        }
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl FetchOptions {
    /// Inserts an option, returning the previous value.
    #[inline]
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Gets an option by key.
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the number of options.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no options are set.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over all options.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns the underlying JSON object.
    #[inline]
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns the selector to wait for, if set to a non-empty string.
    #[must_use]
    pub fn wait_for(&self) -> Option<&str> {
        self.0
            .get(WAIT_FOR)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Returns the selector wait bound, if set to a non-negative number of seconds.
    #[must_use]
    pub fn wait_for_timeout(&self) -> Option<Duration> {
        let secs = self.0.get(WAIT_FOR_TIMEOUT).and_then(Value::as_f64)?;
        Duration::try_from_secs_f64(secs).ok()
    }

    /// Returns the selector wait bound, falling back to the default.
    #[inline]
    #[must_use]
    pub fn effective_wait_for_timeout(&self) -> Duration {
        self.wait_for_timeout().unwrap_or(DEFAULT_WAIT_FOR_TIMEOUT)
    }
}

// ============================================================================
// Tests
// ============================================================================
