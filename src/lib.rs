//! Scraper RPC - page fetching over a message broker.
//!
//! Requesters publish fetch requests to a shared queue; workers render the
//! pages with a headless browser and publish the HTML back to each
//! requester's private reply queue. Replies are matched to calls by
//! correlation id, and every call carries its own deadline.
//!
//! # Architecture
//!
//! ```text
//! caller ──call()──► Requester ──request──► [scraper_api_queue] ──► Dispatcher ──► PageFetcher
//!   ▲                   │                                                │
//!   └── PendingTable ◄──┴──── reply loop ◄──── [amq.gen-…] ◄──── reply ─┘
//! ```
//!
//! - Each [`Requester`] owns one exclusive, auto-deleting reply queue and one
//!   background task consuming it
//! - The [`Dispatcher`] acknowledges a request only after its reply is
//!   published (at-least-once)
//! - Late or duplicate replies are dropped without error
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use scraper_rpc::{BrokerConfig, FetchOptions, Requester, RequesterConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let requester =
//!         Requester::connect_amqp(&BrokerConfig::from_env(), RequesterConfig::new()).await?;
//!
//!     let options = FetchOptions::new()
//!         .with_wait_for(".content")
//!         .with_wait_for_timeout(Duration::from_secs(2));
//!
//!     let html = requester
//!         .fetch_html("https://example.com", &options, Duration::from_secs(30))
//!         .await?;
//!     println!("{html}");
//!
//!     requester.close().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Requester`], pending-request table, blocking facade |
//! | [`config`] | Broker, requester and dispatcher settings |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`fetcher`] | [`PageFetcher`](fetcher::PageFetcher) seam and implementations |
//! | [`identifiers`] | [`CorrelationId`] |
//! | [`protocol`] | Request/reply payloads and codec |
//! | [`server`] | [`Dispatcher`] worker loop |
//! | [`transport`] | Broker adapters: AMQP and in-memory |
//!
//! # Features
//!
//! - **`chromium`**: headless Chromium fetcher (`chromiumoxide`)
//! - **`cli`**: `scraper-worker` and `scraper-fetch` binaries

// ============================================================================
// Modules
// ============================================================================

/// Requester side: async client, blocking client, pending table.
pub mod client;

/// Configuration structs and defaults.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Page fetching capability.
pub mod fetcher;

/// Type-safe identifiers.
pub mod identifiers;

/// Wire payloads and codec.
pub mod protocol;

/// Worker side: request dispatcher.
pub mod server;

/// Broker transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{BlockingRequester, ConnectionState, Requester, RequesterBuilder};

// Configuration
pub use config::{BrokerConfig, DEFAULT_QUEUE, DispatcherConfig, RequesterConfig};

// Error types
pub use error::{Error, Result};

// Fetcher types
pub use fetcher::{FetchError, PageFetcher};

// Identifier types
pub use identifiers::CorrelationId;

// Protocol types
pub use protocol::{FetchOptions, FetchOutcome, FetchRequest, Reply};

// Server types
pub use server::{Dispatcher, Disposition};
