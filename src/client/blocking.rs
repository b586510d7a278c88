//! Synchronous facade over [`Requester`].
//!
//! Owns a current-thread runtime and blocks the calling thread for each
//! call. Must not be used from inside an async context.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use scraper_rpc::{BlockingRequester, BrokerConfig, FetchOptions, RequesterConfig};
//!
//! # fn example() -> scraper_rpc::Result<()> {
//! let requester = BlockingRequester::connect_amqp(&BrokerConfig::from_env(), RequesterConfig::new())?;
//! let html = requester.fetch_html("https://example.com", &FetchOptions::new(), Duration::from_secs(30))?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use crate::config::{BrokerConfig, RequesterConfig};
use crate::error::Result;
use crate::protocol::{FetchOptions, Reply};
use crate::transport::Transport;

use super::requester::{ConnectionState, Requester};

// ============================================================================
// BlockingRequester
// ============================================================================

/// Blocking RPC client.
#[derive(Debug)]
pub struct BlockingRequester {
    requester: Requester,
    runtime: Runtime,
}

impl BlockingRequester {
    /// Connects a requester over the given transport.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`](crate::Error::Io) if the runtime cannot be created
    /// - Any error from [`Requester::connect`]
    pub fn connect(transport: Arc<dyn Transport>, config: RequesterConfig) -> Result<Self> {
        let runtime = new_runtime()?;
        let requester = runtime.block_on(Requester::builder().config(config).connect(transport))?;
        Ok(Self { requester, runtime })
    }

    /// Opens an owned AMQP connection and connects.
    ///
    /// # Errors
    ///
    /// Same as [`Requester::connect_amqp`].
    pub fn connect_amqp(broker: &BrokerConfig, config: RequesterConfig) -> Result<Self> {
        let runtime = new_runtime()?;
        let requester = runtime.block_on(Requester::connect_amqp(broker, config))?;
        Ok(Self { requester, runtime })
    }

    /// Blocking [`Requester::call`].
    ///
    /// # Errors
    ///
    /// Same as [`Requester::call`].
    pub fn call(&self, url: &str, options: &FetchOptions, timeout: Duration) -> Result<Reply> {
        self.runtime
            .block_on(self.requester.call(url, options, timeout))
    }

    /// Blocking [`Requester::call_default`].
    ///
    /// # Errors
    ///
    /// Same as [`Requester::call`].
    pub fn call_default(&self, url: &str, options: &FetchOptions) -> Result<Reply> {
        self.runtime
            .block_on(self.requester.call_default(url, options))
    }

    /// Blocking [`Requester::fetch_html`].
    ///
    /// # Errors
    ///
    /// Same as [`Requester::fetch_html`].
    pub fn fetch_html(&self, url: &str, options: &FetchOptions, timeout: Duration) -> Result<String> {
        self.runtime
            .block_on(self.requester.fetch_html(url, options, timeout))
    }

    /// Returns the requester state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.requester.state()
    }

    /// Returns the async requester sharing this connection.
    #[inline]
    #[must_use]
    pub fn as_async(&self) -> &Requester {
        &self.requester
    }

    /// Closes the requester.
    ///
    /// # Errors
    ///
    /// Same as [`Requester::close`].
    pub fn close(self) -> Result<()> {
        self.runtime.block_on(self.requester.close())
    }
}

fn new_runtime() -> Result<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

// ============================================================================
// Tests
// ============================================================================
