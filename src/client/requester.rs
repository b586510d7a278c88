//! RPC client.
//!
//! A [`Requester`] owns one private reply queue and one background task
//! consuming it. Any number of tasks may call concurrently; each call
//! registers a slot in the pending table, publishes, then waits with its own
//! deadline.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──► Ready ──close() / reply stream ends──► Closed
//!                                  │
//!                                  └── setup fails ──► Disconnected
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BrokerConfig, RequesterConfig};
use crate::error::{Error, Result};
use crate::identifiers::CorrelationId;
use crate::protocol::{CONTENT_TYPE, FetchOptions, Reply, decode_reply, encode_request};
use crate::transport::{AmqpTransport, Delivery, DeliveryStream, Envelope, Transport};

use super::builder::RequesterBuilder;
use super::pending::PendingTable;

// ============================================================================
// Types
// ============================================================================

type ReplyTable = PendingTable<Result<Reply>>;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a [`Requester`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Built but not connected.
    Disconnected,
    /// Setting up the reply queue.
    Connecting,
    /// Accepting calls.
    Ready,
    /// Shut down; calls fail with [`Error::ConnectionClosed`].
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Requester
// ============================================================================

/// Correlated request/reply client.
///
/// Cheap to clone; clones share the reply queue and pending table.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use scraper_rpc::{BrokerConfig, FetchOptions, Requester, RequesterConfig};
///
/// # async fn example() -> scraper_rpc::Result<()> {
/// let requester =
///     Requester::connect_amqp(&BrokerConfig::from_env(), RequesterConfig::new()).await?;
///
/// let options = FetchOptions::new().with_wait_for(".content");
/// let reply = requester
///     .call("https://example.com", &options, Duration::from_secs(30))
///     .await?;
///
/// println!("{}", reply.into_html()?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Requester {
    inner: Arc<RequesterInner>,
}

struct RequesterInner {
    transport: Arc<dyn Transport>,
    config: RequesterConfig,
    pending: ReplyTable,
    state: Arc<Mutex<ConnectionState>>,
    reply_to: Mutex<Option<String>>,
    reply_task: Mutex<Option<JoinHandle<()>>>,
    owns_transport: bool,
}

impl fmt::Debug for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("queue", &self.inner.config.queue)
            .field("state", &self.state())
            .field("reply_to", &self.reply_to())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Requester - Construction
// ============================================================================

impl Requester {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> RequesterBuilder {
        RequesterBuilder::new()
    }

    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: RequesterConfig,
        owns_transport: bool,
    ) -> Self {
        let pending = PendingTable::new(config.max_pending);
        Self {
            inner: Arc::new(RequesterInner {
                transport,
                config,
                pending,
                state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
                reply_to: Mutex::new(None),
                reply_task: Mutex::new(None),
                owns_transport,
            }),
        }
    }

    /// Opens an AMQP connection owned by this requester and connects.
    ///
    /// [`close`](Self::close) also closes the broker connection.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if either config is invalid
    /// - A transport error if the broker is unreachable
    pub async fn connect_amqp(broker: &BrokerConfig, config: RequesterConfig) -> Result<Self> {
        broker.validate()?;
        config.validate()?;

        let transport = AmqpTransport::connect(broker).await?;
        let requester = Self::new(Arc::new(transport), config, true);
        requester.connect().await?;
        Ok(requester)
    }
}

// ============================================================================
// Requester - Lifecycle
// ============================================================================

impl Requester {
    /// Sets up the reply queue and starts the reply loop.
    ///
    /// Calling it on a ready requester is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the requester was closed
    /// - A transport error if queue setup fails; the state returns to
    ///   `Disconnected` and `connect` may be retried
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Closed => return Err(Error::ConnectionClosed),
                ConnectionState::Connecting => {
                    return Err(Error::protocol("Requester is already connecting"));
                }
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            }
        }

        match self.open_reply_queue().await {
            Ok((reply_to, stream)) => {
                // Held until the task is stored, so the reply loop can only
                // observe `Ready` and `close` always finds the task
                let mut state = self.inner.state.lock();
                if *state != ConnectionState::Connecting {
                    return Err(Error::ConnectionClosed);
                }

                *self.inner.reply_to.lock() = Some(reply_to.clone());
                let task = tokio::spawn(reply_loop(
                    stream,
                    self.inner.pending.clone(),
                    Arc::clone(&self.inner.state),
                ));
                *self.inner.reply_task.lock() = Some(task);
                *state = ConnectionState::Ready;
                drop(state);

                info!(
                    queue = %self.inner.config.queue,
                    reply_to = %reply_to,
                    "Requester connected"
                );
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = ConnectionState::Disconnected;
                error!(error = %e, "Requester setup failed");
                Err(e)
            }
        }
    }

    async fn open_reply_queue(&self) -> Result<(String, DeliveryStream)> {
        let transport = &self.inner.transport;

        if self.inner.config.declare_queue {
            transport
                .declare_queue(&self.inner.config.queue, self.inner.config.durable)
                .await?;
        }

        let reply_to = transport.declare_reply_queue().await?;
        let stream = transport.consume(&reply_to, 0).await?;
        Ok((reply_to, stream))
    }

    /// Stops the reply loop and fails every pending call.
    ///
    /// Closes the broker connection too when it was opened by
    /// [`connect_amqp`](Self::connect_amqp). Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a transport error if closing an owned connection fails.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return Ok(());
            }
            *state = ConnectionState::Closed;
        }

        if let Some(task) = self.inner.reply_task.lock().take() {
            task.abort();
        }
        self.inner.pending.fail_all(|| Err(Error::ConnectionClosed));

        info!(queue = %self.inner.config.queue, "Requester closed");

        if self.inner.owns_transport {
            self.inner.transport.close().await?;
        }
        Ok(())
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Returns the reply queue address once connected.
    #[must_use]
    pub fn reply_to(&self) -> Option<String> {
        self.inner.reply_to.lock().clone()
    }

    /// Returns the number of calls awaiting a reply.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Returns `true` if a call with `id` is awaiting a reply.
    #[inline]
    #[must_use]
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.inner.pending.contains(id)
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RequesterConfig {
        &self.inner.config
    }
}

// ============================================================================
// Requester - Calls
// ============================================================================

impl Requester {
    /// Fetches `url` through a worker and waits at most `timeout` for the reply.
    ///
    /// Publishes exactly once. The pending entry is gone when this returns,
    /// whatever the outcome.
    ///
    /// # Returns
    ///
    /// A [`Reply`] whose outcome is either success (HTML) or a fetch failure.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] if no reply arrives in time
    /// - [`Error::ConnectionClosed`] if the requester is closed or closes mid-call
    /// - [`Error::Connection`] if the requester was never connected
    /// - [`Error::Protocol`] if too many calls are in flight
    /// - [`Error::MalformedReply`] if the matching reply cannot be decoded
    /// - A transport error if publishing fails
    pub async fn call(&self, url: &str, options: &FetchOptions, timeout: Duration) -> Result<Reply> {
        let id = CorrelationId::generate();
        let slot = self.inner.pending.register(id)?;

        // Checked after registering: a close that lands later still fails
        // this slot through `fail_all`
        let reply_to = self.ready_reply_to()?;

        let body = encode_request(url, options)?;
        let envelope = Envelope::new(body)
            .with_correlation_id(id.to_string())
            .with_reply_to(reply_to)
            .with_content_type(CONTENT_TYPE);

        // A failed publish drops the slot, which removes the entry
        self.inner
            .transport
            .publish(&self.inner.config.queue, envelope)
            .await?;

        debug!(
            correlation_id = %id,
            url = %url,
            timeout_ms = timeout.as_millis() as u64,
            "Request published"
        );

        let outcome = slot.wait(timeout).await;
        if let Err(e) = &outcome {
            warn!(correlation_id = %id, url = %url, error = %e, "Call failed");
        }
        outcome?
    }

    /// Like [`call`](Self::call), bounded by the configured default timeout.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_default(&self, url: &str, options: &FetchOptions) -> Result<Reply> {
        self.call(url, options, self.inner.config.default_timeout)
            .await
    }

    /// Fetches `url` and returns its HTML, turning a fetch failure into
    /// [`Error::Fetch`].
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call), plus [`Error::Fetch`].
    pub async fn fetch_html(
        &self,
        url: &str,
        options: &FetchOptions,
        timeout: Duration,
    ) -> Result<String> {
        self.call(url, options, timeout).await?.into_html()
    }

    fn ready_reply_to(&self) -> Result<String> {
        match self.state() {
            ConnectionState::Ready => self
                .reply_to()
                .ok_or_else(|| Error::connection("Reply queue not available")),
            ConnectionState::Closed => Err(Error::ConnectionClosed),
            state => Err(Error::connection(format!("Requester is {state}"))),
        }
    }
}

// ============================================================================
// Drop
// ============================================================================

impl Drop for RequesterInner {
    fn drop(&mut self) {
        if let Some(task) = self.reply_task.get_mut().take() {
            task.abort();
        }
    }
}

// ============================================================================
// Reply Loop
// ============================================================================

/// Sole receive-side writer into the pending table.
async fn reply_loop(
    mut stream: DeliveryStream,
    pending: ReplyTable,
    state: Arc<Mutex<ConnectionState>>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(delivery) => handle_reply(&pending, delivery).await,
            Err(e) => {
                error!(error = %e, "Reply stream failed");
                break;
            }
        }
    }

    *state.lock() = ConnectionState::Closed;
    pending.fail_all(|| Err(Error::ConnectionClosed));
    info!("Reply loop stopped");
}

async fn handle_reply(pending: &ReplyTable, delivery: Delivery) {
    let id = delivery
        .envelope
        .correlation_id
        .as_deref()
        .and_then(CorrelationId::parse);

    match id {
        Some(id) => {
            let outcome = decode_reply(&delivery.envelope.body);
            if let Err(e) = &outcome {
                warn!(correlation_id = %id, error = %e, "Malformed reply");
            }
            if !pending.fulfill(&id, outcome) {
                debug!(correlation_id = %id, "Dropped stale reply");
            }
        }
        None => warn!(
            correlation_id = ?delivery.envelope.correlation_id,
            "Dropped reply without a usable correlation id"
        ),
    }

    if let Err(e) = delivery.ack().await {
        error!(error = %e, "Failed to acknowledge reply");
    }
}

// ============================================================================
// Tests
// ============================================================================
