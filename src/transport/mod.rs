//! Broker transport layer.
//!
//! The only link between requester and worker. The core depends on exactly
//! four broker capabilities:
//!
//! 1. Durable, named request queues
//! 2. Per-client exclusive, auto-deleting reply queues
//! 3. Point-to-point publish to a named queue
//! 4. Manual acknowledgment of consumed messages
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   publish(queue)    ┌────────┐   consume(queue)   ┌──────────────┐
//! │  Requester  │────────────────────►│        │───────────────────►│  Dispatcher  │
//! │             │                     │ Broker │                    │              │
//! │ reply loop  │◄────────────────────│        │◄───────────────────│              │
//! └─────────────┘ consume(reply_to)   └────────┘  publish(reply_to) └──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `amqp` | RabbitMQ / AMQP 0-9-1 adapter (lapin) |
//! | `memory` | In-process broker for tests and embedding |

// ============================================================================
// Submodules
// ============================================================================

/// AMQP 0-9-1 transport.
pub mod amqp;

/// In-process transport.
pub mod memory;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::Result;

// ============================================================================
// Re-exports
// ============================================================================

pub use amqp::AmqpTransport;
pub use memory::MemoryBroker;

// ============================================================================
// Types
// ============================================================================

/// Stream of deliveries from one consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

// ============================================================================
// Envelope
// ============================================================================

/// A message body plus the metadata the protocol relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Encoded payload.
    pub body: Vec<u8>,
    /// Correlation token, echoed from request to reply.
    pub correlation_id: Option<String>,
    /// Reply address carried by requests.
    pub reply_to: Option<String>,
    /// Payload MIME type.
    pub content_type: Option<String>,
}

impl Envelope {
    /// Creates an envelope with only a body.
    #[inline]
    #[must_use]
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Sets the correlation id.
    #[inline]
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets the reply address.
    #[inline]
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Sets the content type.
    #[inline]
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

// ============================================================================
// Acknowledger
// ============================================================================

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledges the delivery.
    async fn ack(&self) -> Result<()>;

    /// Negatively acknowledges the delivery.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

// ============================================================================
// Delivery
// ============================================================================

/// A consumed message awaiting acknowledgment.
pub struct Delivery {
    /// The delivered message.
    pub envelope: Envelope,
    /// `true` if the broker delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Creates a delivery settled through `acker`.
    #[inline]
    #[must_use]
    pub fn new(envelope: Envelope, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            redelivered,
            acker,
        }
    }

    /// Acknowledges the delivery; the broker forgets the message.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the broker cannot be reached.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Rejects the delivery, optionally returning it to its queue.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the broker cannot be reached.
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Publish/consume primitives of a message broker.
///
/// Implementations must be shareable across tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares a named request queue. Idempotent.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()>;

    /// Declares a fresh exclusive, auto-deleting reply queue.
    ///
    /// Returns its broker-assigned address.
    async fn declare_reply_queue(&self) -> Result<String>;

    /// Starts consuming a queue with manual acknowledgment.
    ///
    /// `prefetch` bounds unacknowledged deliveries; `0` means unbounded.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream>;

    /// Publishes one message point-to-point to `queue`.
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()>;

    /// Closes the underlying connection.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Tests
// ============================================================================
