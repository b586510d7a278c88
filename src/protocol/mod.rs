//! Wire payloads exchanged through the broker.
//!
//! Every payload is a self-describing JSON object with named fields, so
//! option values can hold any text without corrupting parsing.
//!
//! # Protocol Overview
//!
//! | Message | Direction | Metadata |
//! |---------|-----------|----------|
//! | [`FetchRequest`] | Requester → request queue | `correlation_id`, `reply_to` |
//! | [`Reply`] | Dispatcher → `reply_to` | `correlation_id` (echoed) |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `options` | Opaque fetch options with typed accessors |
//! | `reply` | Reply payload and outcome discriminant |
//! | `request` | Request payload |

// ============================================================================
// Submodules
// ============================================================================

/// Fetch options forwarded to the page fetcher.
pub mod options;

/// Reply payload and codec.
pub mod reply;

/// Request payload and codec.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use options::FetchOptions;
pub use reply::{FetchOutcome, Reply, decode_reply, encode_reply};
pub use request::{FetchRequest, decode_request, encode_request};

/// MIME type stamped on every published payload.
pub const CONTENT_TYPE: &str = "application/json";

// ============================================================================
// Helpers
// ============================================================================

/// Treats an explicit `null` like an absent field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + serde::Deserialize<'de>,
{
    use serde::Deserialize;

    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
