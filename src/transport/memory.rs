//! In-process broker.
//!
//! Mirrors the AMQP semantics the protocol depends on, without a server:
//!
//! - Named queues shared by competing consumers
//! - Exclusive reply queues, deleted when their consumer stream is dropped
//! - Publishing to an unknown queue silently drops the message (default
//!   exchange behaviour)
//! - A delivery dropped without `ack` is requeued and flagged `redelivered`
//! - `prefetch` bounds unacknowledged deliveries per consumer
//!
//! # Example
//!
//! ```
//! use scraper_rpc::transport::{Envelope, MemoryBroker, Transport};
//!
//! # async fn example() -> scraper_rpc::Result<()> {
//! let broker = MemoryBroker::new();
//! broker.declare_queue("jobs", true).await?;
//! broker.publish("jobs", Envelope::new(b"{}".to_vec())).await?;
//! assert_eq!(broker.queue_len("jobs"), 1);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{Acknowledger, Delivery, DeliveryStream, Envelope, Transport};

// ============================================================================
// Types
// ============================================================================

struct Message {
    envelope: Envelope,
    redelivered: bool,
}

// ============================================================================
// MemoryQueue
// ============================================================================

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    depth: AtomicUsize,
    exclusive: bool,
    consumed: AtomicBool,
}

impl MemoryQueue {
    fn new(exclusive: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
            exclusive,
            consumed: AtomicBool::new(false),
        }
    }

    fn push(&self, envelope: Envelope, redelivered: bool) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        // Receiver lives in `self`, so the channel cannot be closed here
        let _ = self.tx.send(Message {
            envelope,
            redelivered,
        });
    }
}

// ============================================================================
// MemoryBroker
// ============================================================================

/// In-process message broker.
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    queues: Mutex<FxHashMap<String, Arc<MemoryQueue>>>,
    closed: watch::Sender<bool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(BrokerInner {
                queues: Mutex::new(FxHashMap::default()),
                closed,
            }),
        }
    }

    /// Returns the number of ready (undelivered) messages in a queue.
    ///
    /// Returns `0` for unknown queues.
    #[must_use]
    pub fn queue_len(&self, name: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(name)
            .map_or(0, |q| q.depth.load(Ordering::SeqCst))
    }

    /// Returns `true` if the queue exists.
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.queues.lock().contains_key(name)
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.inner.queues.lock().get(name).cloned()
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.inner.closed.borrow() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

#[async_trait]
impl Transport for MemoryBroker {
    async fn declare_queue(&self, name: &str, _durable: bool) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(false)));
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        self.ensure_open()?;
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        self.inner
            .queues
            .lock()
            .insert(name.clone(), Arc::new(MemoryQueue::new(true)));
        debug!(queue = %name, "Declared reply queue");
        Ok(name)
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        self.ensure_open()?;

        let memory_queue = self
            .queue(queue)
            .ok_or_else(|| Error::connection(format!("NOT_FOUND - no queue '{queue}'")))?;

        let auto_delete = if memory_queue.exclusive {
            if memory_queue.consumed.swap(true, Ordering::SeqCst) {
                return Err(Error::connection(format!(
                    "RESOURCE_LOCKED - queue '{queue}' is exclusive"
                )));
            }
            Some(AutoDelete {
                broker: Arc::downgrade(&self.inner),
                name: queue.to_string(),
            })
        } else {
            None
        };

        let state = ConsumerState {
            queue: memory_queue,
            closed: self.inner.closed.subscribe(),
            credit: (prefetch > 0).then(|| Arc::new(Semaphore::new(usize::from(prefetch)))),
            _auto_delete: auto_delete,
        };

        Ok(Box::pin(stream::unfold(state, next_delivery)))
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()> {
        self.ensure_open()?;

        match self.queue(queue) {
            Some(q) => {
                q.push(envelope, false);
                trace!(queue = %queue, "Published");
            }
            None => debug!(queue = %queue, "Dropped unroutable message"),
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.send_replace(true);
        debug!("Memory broker closed");
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct ConsumerState {
    queue: Arc<MemoryQueue>,
    closed: watch::Receiver<bool>,
    credit: Option<Arc<Semaphore>>,
    _auto_delete: Option<AutoDelete>,
}

async fn next_delivery(mut state: ConsumerState) -> Option<(Result<Delivery>, ConsumerState)> {
    let queue = Arc::clone(&state.queue);
    let credit = state.credit.clone();

    let next = async {
        let permit = match credit {
            Some(credit) => Some(credit.acquire_owned().await.ok()?),
            None => None,
        };
        let message = queue.rx.lock().await.recv().await?;
        Some((permit, message))
    };

    let (permit, message) = tokio::select! {
        next = next => next?,
        () = closed_signal(&mut state.closed) => return None,
    };
    queue.depth.fetch_sub(1, Ordering::SeqCst);

    let acker = MemoryAcker {
        queue: Arc::clone(&queue),
        pending: Mutex::new(Some(message.envelope.clone())),
        _permit: permit,
    };
    let delivery = Delivery::new(message.envelope, message.redelivered, Box::new(acker));

    Some((Ok(delivery), state))
}

async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Removes an exclusive queue once its consumer goes away.
struct AutoDelete {
    broker: Weak<BrokerInner>,
    name: String,
}

impl Drop for AutoDelete {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.queues.lock().remove(&self.name);
            debug!(queue = %self.name, "Auto-deleted reply queue");
        }
    }
}

// ============================================================================
// MemoryAcker
// ============================================================================

/// Settles a memory delivery; requeues it if dropped unsettled.
struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    pending: Mutex<Option<Envelope>>,
    _permit: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.pending.lock().take();
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        if let Some(envelope) = self.pending.lock().take()
            && requeue
        {
            self.queue.push(envelope, true);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(envelope) = self.pending.get_mut().take() {
            self.queue.push(envelope, true);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use futures_util::StreamExt;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(50);

    async fn broker_with(queue: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_queue(queue, true).await.expect("declare");
        broker
    }

    #[tokio::test]
    async fn test_publish_and_consume() {
        let broker = broker_with("q").await;
        let envelope = Envelope::new(b"hello".to_vec()).with_correlation_id("c1");
        broker.publish("q", envelope.clone()).await.expect("publish");

        let mut stream = broker.consume("q", 0).await.expect("consume");
        let delivery = stream.next().await.expect("item").expect("delivery");

        assert_eq!(delivery.envelope, envelope);
        assert!(!delivery.redelivered);
        delivery.ack().await.expect("ack");
        assert_eq!(broker.queue_len("q"), 0);
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_dropped() {
        let broker = MemoryBroker::new();
        broker
            .publish("nowhere", Envelope::new(Vec::new()))
            .await
            .expect("publish succeeds");
        assert!(!broker.has_queue("nowhere"));
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued() {
        let broker = broker_with("q").await;
        broker.publish("q", Envelope::new(b"x".to_vec())).await.expect("publish");

        let mut stream = broker.consume("q", 0).await.expect("consume");
        let first = stream.next().await.expect("item").expect("delivery");
        drop(first);
        assert_eq!(broker.queue_len("q"), 1);

        let second = stream.next().await.expect("item").expect("delivery");
        assert!(second.redelivered);
        assert_eq!(second.envelope.body, b"x");
    }

    #[tokio::test]
    async fn test_reject_without_requeue_discards() {
        let broker = broker_with("q").await;
        broker.publish("q", Envelope::new(b"x".to_vec())).await.expect("publish");

        let mut stream = broker.consume("q", 0).await.expect("consume");
        let delivery = stream.next().await.expect("item").expect("delivery");
        delivery.reject(false).await.expect("reject");

        assert_eq!(broker.queue_len("q"), 0);
    }

    #[tokio::test]
    async fn test_reply_queue_is_exclusive_and_auto_deleted() {
        let broker = MemoryBroker::new();
        let name = broker.declare_reply_queue().await.expect("declare");
        assert!(name.starts_with("amq.gen-"));

        let stream = broker.consume(&name, 0).await.expect("consume");
        assert!(broker.consume(&name, 0).await.is_err());

        drop(stream);
        assert!(!broker.has_queue(&name));
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked() {
        let broker = broker_with("q").await;
        for _ in 0..2 {
            broker.publish("q", Envelope::new(Vec::new())).await.expect("publish");
        }

        let mut stream = broker.consume("q", 1).await.expect("consume");
        let first = stream.next().await.expect("item").expect("delivery");

        // Second delivery is withheld until the first is settled
        assert!(timeout(TICK, stream.next()).await.is_err());

        first.ack().await.expect("ack");
        let second = timeout(TICK, stream.next()).await.expect("delivered");
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn test_close_ends_streams_and_refuses_publish() {
        let broker = broker_with("q").await;
        let mut stream = broker.consume("q", 0).await.expect("consume");

        broker.close().await.expect("close");

        assert!(timeout(TICK, stream.next()).await.expect("ended").is_none());
        let err = broker.publish("q", Envelope::new(Vec::new())).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_consume_unknown_queue_fails() {
        let broker = MemoryBroker::new();
        assert!(broker.consume("missing", 0).await.is_err());
    }
}
