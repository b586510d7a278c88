//! Round-robin over independent fetchers.
//!
//! Each member is typically one browser instance that navigates one page at
//! a time; the pool spreads concurrent requests across them.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::FetchOptions;

use super::{FetchError, PageFetcher};

// ============================================================================
// FetcherPool
// ============================================================================

/// Fixed set of fetchers used in turn.
pub struct FetcherPool {
    members: Vec<Arc<dyn PageFetcher>>,
    next: AtomicUsize,
}

impl FetcherPool {
    /// Creates a pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `members` is empty.
    pub fn new(members: Vec<Arc<dyn PageFetcher>>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::config("Fetcher pool needs at least one fetcher"));
        }
        Ok(Self {
            members,
            next: AtomicUsize::new(0),
        })
    }

    /// Returns the number of members.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always `false`; a pool is never empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn pick(&self) -> (usize, &Arc<dyn PageFetcher>) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.members.len();
        (index, &self.members[index])
    }
}

#[async_trait]
impl PageFetcher for FetcherPool {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> std::result::Result<String, FetchError> {
        let (index, member) = self.pick();
        trace!(member = index, url = %url, "Fetcher selected");
        member.fetch(url, options).await
    }

    async fn shutdown(&self) {
        for member in &self.members {
            member.shutdown().await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    struct Named {
        name: &'static str,
        closed: AtomicBool,
    }

    impl Named {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl PageFetcher for Named {
        async fn fetch(
            &self,
            _url: &str,
            _options: &FetchOptions,
        ) -> std::result::Result<String, FetchError> {
            Ok(self.name.to_string())
        }

        async fn shutdown(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(FetcherPool::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_round_robin_order() {
        let pool = FetcherPool::new(vec![
            Named::new("a") as Arc<dyn PageFetcher>,
            Named::new("b") as Arc<dyn PageFetcher>,
        ])
        .expect("pool");
        let options = FetchOptions::new();

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(pool.fetch("u", &options).await.expect("fetch"));
        }
        assert_eq!(seen, ["a", "b", "a", "b"]);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_reaches_every_member() {
        let a = Named::new("a");
        let b = Named::new("b");
        let pool = FetcherPool::new(vec![
            a.clone() as Arc<dyn PageFetcher>,
            b.clone() as Arc<dyn PageFetcher>,
        ])
        .expect("pool");

        pool.shutdown().await;
        assert!(a.closed.load(Ordering::SeqCst));
        assert!(b.closed.load(Ordering::SeqCst));
    }
}
