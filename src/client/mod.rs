//! Requester side of the RPC.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `blocking` | Synchronous facade |
//! | `builder` | [`RequesterBuilder`] |
//! | `pending` | Correlation table of in-flight calls |
//! | `requester` | Async client and reply loop |

// ============================================================================
// Submodules
// ============================================================================

/// Synchronous client.
pub mod blocking;

/// Requester builder.
pub mod builder;

/// Pending-request table.
pub mod pending;

/// Async client.
pub mod requester;

// ============================================================================
// Re-exports
// ============================================================================

pub use blocking::BlockingRequester;
pub use builder::RequesterBuilder;
pub use pending::{PendingSlot, PendingTable};
pub use requester::{ConnectionState, Requester};
