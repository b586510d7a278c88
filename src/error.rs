//! Error types for scraper RPC.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```no_run
//! use scraper_rpc::{FetchOptions, Requester, Result};
//!
//! async fn example(requester: &Requester) -> Result<String> {
//!     let reply = requester.call_default("https://example.com", &FetchOptions::new()).await?;
//!     reply.into_html()
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Transport | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`], [`Error::Amqp`] |
//! | Protocol | [`Error::Protocol`], [`Error::MalformedRequest`], [`Error::MalformedReply`] |
//! | Execution | [`Error::RequestTimeout`], [`Error::Fetch`] |
//! | External | [`Error::Io`], [`Error::Json`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::CorrelationId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when broker, requester or dispatcher settings are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Broker connection or publish failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Broker did not accept the connection in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection or consumer stream closed while a call was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// AMQP client error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or local protocol limit.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Request payload could not be decoded.
    ///
    /// Never retried: a malformed request cannot become valid on redelivery.
    #[error("Malformed request: {message}")]
    MalformedRequest {
        /// Decoder diagnostic.
        message: String,
    },

    /// Reply payload could not be decoded.
    #[error("Malformed reply: {message}")]
    MalformedReply {
        /// Decoder diagnostic.
        message: String,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// No reply arrived within the caller's bound.
    #[error("Request {correlation_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The call that timed out.
        correlation_id: CorrelationId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The worker replied with a fetch failure.
    #[error("Fetch failed ({kind}): {message}")]
    Fetch {
        /// Failure kind reported by the worker.
        kind: String,
        /// Failure message, verbatim.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a malformed request error.
    #[inline]
    pub fn malformed_request(message: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: message.into(),
        }
    }

    /// Creates a malformed reply error.
    #[inline]
    pub fn malformed_reply(message: impl Into<String>) -> Self {
        Self::MalformedReply {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(correlation_id: CorrelationId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            correlation_id,
            timeout_ms,
        }
    }

    /// Creates a fetch failure error.
    #[inline]
    pub fn fetch(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if the request could not even be asked.
    ///
    /// Distinguishes "couldn't reach the broker" from "no answer".
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::Amqp(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::RequestTimeout { .. } | Self::Fetch { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
