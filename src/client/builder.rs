//! Builder for [`Requester`] instances.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use scraper_rpc::Requester;
//! use scraper_rpc::transport::MemoryBroker;
//!
//! # async fn example() -> scraper_rpc::Result<()> {
//! let requester = Requester::builder()
//!     .queue("pages")
//!     .default_timeout(Duration::from_secs(10))
//!     .connect(Arc::new(MemoryBroker::new()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use crate::config::RequesterConfig;
use crate::error::Result;
use crate::transport::Transport;

use super::requester::Requester;

// ============================================================================
// RequesterBuilder
// ============================================================================

/// Builder for configuring a [`Requester`].
///
/// Use [`Requester::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct RequesterBuilder {
    config: RequesterConfig,
}

// ============================================================================
// RequesterBuilder Implementation
// ============================================================================

impl RequesterBuilder {
    /// Creates a builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: RequesterConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the request queue.
    #[inline]
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.config.queue = queue.into();
        self
    }

    /// Sets the bound used by [`Requester::call_default`].
    #[inline]
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Sets the in-flight call limit.
    #[inline]
    #[must_use]
    pub fn max_pending(mut self, max_pending: usize) -> Self {
        self.config.max_pending = max_pending;
        self
    }

    /// Enables or disables declaring the request queue on connect.
    #[inline]
    #[must_use]
    pub fn declare_queue(mut self, declare: bool) -> Self {
        self.config.declare_queue = declare;
        self
    }

    /// Declares the request queue durable or transient.
    ///
    /// Must match how workers declare it.
    #[inline]
    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.config.durable = durable;
        self
    }

    /// Builds a disconnected requester.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the settings are invalid.
    pub fn build(self, transport: Arc<dyn Transport>) -> Result<Requester> {
        self.config.validate()?;
        Ok(Requester::new(transport, self.config, false))
    }

    /// Builds a requester and connects it.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`](crate::Error::Config) if the settings are invalid
    /// - A transport error if the reply queue cannot be set up
    pub async fn connect(self, transport: Arc<dyn Transport>) -> Result<Requester> {
        let requester = self.build(transport)?;
        requester.connect().await?;
        Ok(requester)
    }
}

// ============================================================================
// Tests
// ============================================================================
