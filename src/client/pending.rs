//! Correlation table of in-flight calls.
//!
//! Each call registers a one-shot slot under its correlation id. The reply
//! loop fulfils slots; the caller waits on its slot with a deadline. A slot
//! is removed exactly once: by `fulfill`, by `fail_all`, or when the waiting
//! side is dropped or times out. A reply arriving after that finds nothing
//! and is discarded.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::CorrelationId;

// ============================================================================
// Types
// ============================================================================

struct Entry<T> {
    tx: oneshot::Sender<T>,
    created_at: Instant,
}

type SlotMap<T> = FxHashMap<CorrelationId, Entry<T>>;

// ============================================================================
// PendingTable
// ============================================================================

/// Map from correlation id to the caller awaiting that reply.
pub struct PendingTable<T> {
    slots: Arc<Mutex<SlotMap<T>>>,
    max_pending: usize,
}

impl<T> Clone for PendingTable<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            max_pending: self.max_pending,
        }
    }
}

impl<T> PendingTable<T> {
    /// Creates an empty table accepting at most `max_pending` slots.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(FxHashMap::default())),
            max_pending,
        }
    }

    /// Registers a slot for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the table is full or `id` is already
    /// registered.
    pub fn register(&self, id: CorrelationId) -> Result<PendingSlot<T>> {
        let (tx, rx) = oneshot::channel();

        {
            let mut slots = self.slots.lock();
            if slots.len() >= self.max_pending {
                warn!(
                    pending = slots.len(),
                    max = self.max_pending,
                    "Too many pending requests"
                );
                return Err(Error::protocol(format!(
                    "Too many pending requests: {}/{}",
                    slots.len(),
                    self.max_pending
                )));
            }
            if slots.contains_key(&id) {
                return Err(Error::protocol(format!("Duplicate correlation id {id}")));
            }
            slots.insert(
                id,
                Entry {
                    tx,
                    created_at: Instant::now(),
                },
            );
        }

        Ok(PendingSlot {
            id,
            rx: Some(rx),
            slots: Arc::clone(&self.slots),
        })
    }

    /// Delivers `value` to the caller waiting on `id`.
    ///
    /// Returns `false` if no such caller exists (late or foreign reply).
    pub fn fulfill(&self, id: &CorrelationId, value: T) -> bool {
        let Some(entry) = self.slots.lock().remove(id) else {
            return false;
        };

        debug!(
            correlation_id = %id,
            waited_ms = entry.created_at.elapsed().as_millis() as u64,
            "Reply matched"
        );
        // Receiver may have been dropped between removal and send
        entry.tx.send(value).is_ok()
    }

    /// Resolves every outstanding slot with a value from `make`.
    pub fn fail_all(&self, mut make: impl FnMut() -> T) {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        if drained.is_empty() {
            return;
        }

        debug!(count = drained.len(), "Failing pending requests");
        for (_, entry) in drained {
            let _ = entry.tx.send(make());
        }
    }

    /// Returns the number of outstanding slots.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns `true` if nothing is outstanding.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Returns `true` if `id` is outstanding.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.slots.lock().contains_key(id)
    }
}

// ============================================================================
// PendingSlot
// ============================================================================

/// The waiting side of one registered call.
///
/// Dropping the slot removes its table entry.
pub struct PendingSlot<T> {
    id: CorrelationId,
    rx: Option<oneshot::Receiver<T>>,
    slots: Arc<Mutex<SlotMap<T>>>,
}

impl<T> PendingSlot<T> {
    /// Returns the correlation id of this slot.
    #[inline]
    #[must_use]
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Waits for the value, at most `limit`.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] if nothing arrives in time
    /// - [`Error::ConnectionClosed`] if the table entry was dropped unfulfilled
    pub async fn wait(mut self, limit: Duration) -> Result<T> {
        let Some(rx) = self.rx.take() else {
            return Err(Error::ConnectionClosed);
        };

        match timeout(limit, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::request_timeout(self.id, limit.as_millis() as u64)),
        }
    }
}

impl<T> Drop for PendingSlot<T> {
    fn drop(&mut self) {
        if self.slots.lock().remove(&self.id).is_some() {
            debug!(correlation_id = %self.id, "Removed abandoned correlation");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_register_and_fulfill() {
        let table = PendingTable::<u32>::new(8);
        let id = CorrelationId::generate();
        let slot = table.register(id).expect("register");

        let mut wait = task::spawn(slot.wait(Duration::from_secs(5)));
        assert_pending!(wait.poll());

        assert!(table.fulfill(&id, 7));
        assert!(wait.is_woken());
        let value = assert_ready!(wait.poll()).expect("value");
        assert_eq!(value, 7);
        assert!(table.is_empty());
    }

    #[test]
    fn test_fulfill_unknown_id_is_ignored() {
        let table = PendingTable::<u32>::new(8);
        assert!(!table.fulfill(&CorrelationId::generate(), 1));
    }

    #[tokio::test]
    async fn test_fulfill_goes_only_to_matching_slot() {
        let table = PendingTable::<&'static str>::new(8);
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        let slot_a = table.register(a).expect("a");
        let slot_b = table.register(b).expect("b");

        let mut wait_a = task::spawn(slot_a.wait(Duration::from_secs(5)));
        let mut wait_b = task::spawn(slot_b.wait(Duration::from_secs(5)));
        assert_pending!(wait_a.poll());
        assert_pending!(wait_b.poll());

        assert!(table.fulfill(&b, "for b"));
        assert_pending!(wait_a.poll());
        assert_eq!(assert_ready!(wait_b.poll()).expect("b"), "for b");
        assert_eq!(table.len(), 1);
        assert!(table.contains(&a));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = PendingTable::<u32>::new(8);
        let id = CorrelationId::generate();
        let _slot = table.register(id).expect("register");
        assert!(table.register(id).is_err());
    }

    #[test]
    fn test_capacity_enforced() {
        let table = PendingTable::<u32>::new(1);
        let _slot = table.register(CorrelationId::generate()).expect("first");
        let err = table.register(CorrelationId::generate()).err().expect("full");
        assert!(err.to_string().contains("Too many pending requests"));
    }

    #[test]
    fn test_dropped_slot_removes_entry() {
        let table = PendingTable::<u32>::new(8);
        let id = CorrelationId::generate();
        let slot = table.register(id).expect("register");
        assert!(table.contains(&id));

        drop(slot);
        assert!(!table.contains(&id));
        assert!(!table.fulfill(&id, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_and_cleans_up() {
        let table = PendingTable::<u32>::new(8);
        let id = CorrelationId::generate();
        let slot = table.register(id).expect("register");

        let err = slot.wait(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }));
        assert!(err.is_timeout());
        assert!(table.is_empty());

        // Late value finds nobody
        assert!(!table.fulfill(&id, 1));
    }

    #[tokio::test]
    async fn test_fail_all_resolves_everyone() {
        let table = PendingTable::<Result<u32>>::new(8);
        let slot_a = table.register(CorrelationId::generate()).expect("a");
        let slot_b = table.register(CorrelationId::generate()).expect("b");

        let mut wait_a = task::spawn(slot_a.wait(Duration::from_secs(5)));
        let mut wait_b = task::spawn(slot_b.wait(Duration::from_secs(5)));
        assert_pending!(wait_a.poll());
        assert_pending!(wait_b.poll());

        table.fail_all(|| Err(Error::ConnectionClosed));

        let a = assert_ready!(wait_a.poll()).expect("delivered");
        let b = assert_ready!(wait_b.poll()).expect("delivered");
        assert!(matches!(a, Err(Error::ConnectionClosed)));
        assert!(matches!(b, Err(Error::ConnectionClosed)));
        assert!(table.is_empty());
    }
}
