//! Fetch request payload and its codec.
//!
//! # Format
//!
//! ```json
//! {
//!   "url": "https://example.com",
//!   "parameters": { "wait_for": ".content", "wait_for_timeout": 2 }
//! }
//! ```
//!
//! `correlation_id` and `reply_to` travel as message metadata, never in the
//! payload.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{FetchOptions, null_as_default};

// ============================================================================
// FetchRequest
// ============================================================================

/// A request to fetch and render one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Target URL.
    pub url: String,

    /// Options forwarded to the fetcher. Absent or `null` means empty.
    #[serde(default, deserialize_with = "null_as_default")]
    pub parameters: FetchOptions,
}

impl FetchRequest {
    /// Creates a new request.
    #[inline]
    #[must_use]
    pub fn new(url: impl Into<String>, parameters: FetchOptions) -> Self {
        Self {
            url: url.into(),
            parameters,
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Encodes a request payload.
///
/// # Errors
///
/// Returns [`Error::Json`] if serialization fails.
pub fn encode_request(url: &str, options: &FetchOptions) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        url: &'a str,
        parameters: &'a FetchOptions,
    }

    Ok(serde_json::to_vec(&Borrowed {
        url,
        parameters: options,
    })?)
}

/// Decodes a request payload.
///
/// # Errors
///
/// Returns [`Error::MalformedRequest`] if the payload is not a JSON object
/// with a string `url`, or if `parameters` is present but not an object.
pub fn decode_request(body: &[u8]) -> Result<FetchRequest> {
    serde_json::from_slice(body).map_err(|e| Error::malformed_request(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
