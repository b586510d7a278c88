//! Worker side of the RPC.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `dispatcher` | Request loop, reply publishing and acknowledgment |

// ============================================================================
// Submodules
// ============================================================================

/// Request dispatcher.
pub mod dispatcher;

// ============================================================================
// Re-exports
// ============================================================================

pub use dispatcher::{Dispatcher, Disposition, MALFORMED_KIND, PANIC_KIND};
