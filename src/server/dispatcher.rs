//! Worker loop turning requests into fetches and replies.
//!
//! Per delivery: decode, fetch, publish the reply to `reply_to` with the
//! request's correlation id, then acknowledge. The acknowledgment always
//! follows the publish, so a crash in between leaves the request to be
//! redelivered. Fetch failures and panics become failure replies; they never
//! stop the loop.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use scraper_rpc::{Dispatcher, DispatcherConfig};
//! use scraper_rpc::fetcher::PageFetcher;
//! use scraper_rpc::transport::MemoryBroker;
//!
//! # async fn example(fetcher: Arc<dyn PageFetcher>) -> scraper_rpc::Result<()> {
//! let dispatcher = Dispatcher::new(
//!     Arc::new(MemoryBroker::new()),
//!     fetcher,
//!     DispatcherConfig::new().with_prefetch(4),
//! )?;
//!
//! dispatcher
//!     .run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::future::{Future, pending};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{FutureExt, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::fetcher::PageFetcher;
use crate::protocol::{
    CONTENT_TYPE, FetchOptions, FetchOutcome, Reply, decode_request, encode_reply,
};
use crate::transport::{Delivery, DeliveryStream, Envelope, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Failure kind for fetchers that panicked.
pub const PANIC_KIND: &str = "Panic";

/// Failure kind for requests that could not be decoded.
pub const MALFORMED_KIND: &str = "MalformedRequest";

// ============================================================================
// Disposition
// ============================================================================

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Fetched, replied and acknowledged.
    Replied,
    /// Undecodable; a failure reply was sent and the message acknowledged.
    RepliedMalformed,
    /// Acknowledged without a reply.
    Dropped,
    /// Reply could not be published; returned to the queue.
    Requeued,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Consumes the request queue and answers each request.
///
/// Cheap to clone; clones share transport and fetcher.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    fetcher: Arc<dyn PageFetcher>,
    config: DispatcherConfig,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid.
    pub fn new(
        transport: Arc<dyn Transport>,
        fetcher: Arc<dyn PageFetcher>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            fetcher,
            config,
        })
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Returns the fetcher.
    #[inline]
    #[must_use]
    pub fn fetcher(&self) -> &Arc<dyn PageFetcher> {
        &self.fetcher
    }

    /// Declares the request queue and starts consuming it.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the queue cannot be declared or consumed.
    pub async fn bind(&self) -> Result<DeliveryStream> {
        self.transport
            .declare_queue(&self.config.queue, self.config.durable)
            .await?;
        let stream = self
            .transport
            .consume(&self.config.queue, self.config.prefetch)
            .await?;

        info!(
            queue = %self.config.queue,
            prefetch = self.config.prefetch,
            "Request queue bound"
        );
        Ok(stream)
    }

    /// Serves requests until the broker connection ends.
    ///
    /// # Errors
    ///
    /// Same as [`run_until`](Self::run_until).
    pub async fn run(&self) -> Result<()> {
        self.run_until(pending()).await
    }

    /// Serves requests until `shutdown` completes, then waits for in-flight
    /// requests to finish.
    ///
    /// # Errors
    ///
    /// - A transport error if binding fails
    /// - [`Error::ConnectionClosed`] if the request stream ends before shutdown
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut stream = self.bind().await?;
        let slots = Arc::new(Semaphore::new(usize::from(self.config.prefetch)));
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        info!(queue = %self.config.queue, "Worker started");

        // A slot is taken before pulling the next delivery, so shutdown is
        // never blocked behind a full worker
        let mut permit = None;

        let outcome = loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                }

                acquired = Arc::clone(&slots).acquire_owned(), if permit.is_none() => {
                    match acquired {
                        Ok(slot) => permit = Some(slot),
                        Err(_) => break Err(Error::protocol("Worker slots closed")),
                    }
                }

                item = stream.next(), if permit.is_some() => match item {
                    Some(Ok(delivery)) => {
                        let permit = permit.take();
                        let this = self.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            if let Err(e) = this.on_message(delivery).await {
                                error!(error = %e, "Failed to settle request");
                            }
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Request stream failed");
                        break Err(e);
                    }
                    None => {
                        warn!(queue = %self.config.queue, "Request stream ended");
                        break Err(Error::ConnectionClosed);
                    }
                },
            }
        };

        drop(stream);

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Draining in-flight requests");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }

        info!(queue = %self.config.queue, "Worker stopped");
        outcome
    }

    /// Handles one delivery end to end.
    ///
    /// # Errors
    ///
    /// Returns a transport error only if the delivery cannot be settled.
    pub async fn on_message(&self, delivery: Delivery) -> Result<Disposition> {
        let started = Instant::now();
        let correlation_id = delivery.envelope.correlation_id.clone();
        let reply_to = delivery.envelope.reply_to.clone();

        let request = match decode_request(&delivery.envelope.body) {
            Ok(request) => request,
            Err(e) => return self.on_malformed(delivery, e).await,
        };

        let Some(reply_to) = reply_to else {
            warn!(url = %request.url, "Request without reply_to, dropping");
            delivery.ack().await?;
            return Ok(Disposition::Dropped);
        };

        debug!(
            correlation_id = ?correlation_id,
            url = %request.url,
            redelivered = delivery.redelivered,
            "Request received"
        );

        let outcome = self.fetch(&request.url, &request.parameters).await;
        let success = outcome.is_success();
        let reply = Reply::new(request.url, request.parameters, outcome);

        let body = match encode_reply(&reply) {
            Ok(body) => body,
            Err(e) => {
                delivery.reject(false).await?;
                return Err(e);
            }
        };

        let mut envelope = Envelope::new(body).with_content_type(CONTENT_TYPE);
        envelope.correlation_id = correlation_id.clone();

        if let Err(e) = self.transport.publish(&reply_to, envelope).await {
            error!(
                correlation_id = ?correlation_id,
                reply_to = %reply_to,
                error = %e,
                "Failed to publish reply, requeueing request"
            );
            delivery.reject(true).await?;
            return Ok(Disposition::Requeued);
        }

        delivery.ack().await?;

        debug!(
            correlation_id = ?correlation_id,
            url = %reply.url,
            success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request handled"
        );
        Ok(Disposition::Replied)
    }

    async fn fetch(&self, url: &str, options: &FetchOptions) -> FetchOutcome {
        let fetch = AssertUnwindSafe(self.fetcher.fetch(url, options)).catch_unwind();

        match fetch.await {
            Ok(Ok(html)) => FetchOutcome::success(html),
            Ok(Err(e)) => {
                warn!(url = %url, kind = %e.kind, message = %e.message, "Fetch failed");
                FetchOutcome::failure(e.kind, e.message)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(url = %url, panic = %message, "Fetcher panicked");
                FetchOutcome::failure(PANIC_KIND, message)
            }
        }
    }

    async fn on_malformed(&self, delivery: Delivery, err: Error) -> Result<Disposition> {
        let envelope = &delivery.envelope;
        warn!(
            correlation_id = ?envelope.correlation_id,
            error = %err,
            "Malformed request"
        );

        let target = match (&envelope.reply_to, &envelope.correlation_id) {
            (Some(reply_to), Some(id)) if self.config.reply_on_malformed => {
                Some((reply_to.clone(), id.clone()))
            }
            _ => None,
        };

        let Some((reply_to, id)) = target else {
            delivery.ack().await?;
            return Ok(Disposition::Dropped);
        };

        let message = match &err {
            Error::MalformedRequest { message } => message.clone(),
            other => other.to_string(),
        };
        let reply = Reply::new(
            String::new(),
            FetchOptions::new(),
            FetchOutcome::failure(MALFORMED_KIND, message),
        );
        let published = match encode_reply(&reply) {
            Ok(body) => {
                let envelope = Envelope::new(body)
                    .with_correlation_id(id)
                    .with_content_type(CONTENT_TYPE);
                self.transport.publish(&reply_to, envelope).await
            }
            Err(e) => Err(e),
        };

        delivery.ack().await?;

        match published {
            Ok(()) => Ok(Disposition::RepliedMalformed),
            Err(e) => {
                warn!(error = %e, "Failed to answer malformed request");
                Ok(Disposition::Dropped)
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "fetcher panicked".to_string()
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Request task failed");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{Notify, oneshot};
    use tokio::time::timeout;

    use crate::fetcher::FetchError;
    use crate::protocol::{decode_reply, encode_request};
    use crate::transport::MemoryBroker;

    const REQUESTS: &str = "dispatcher-requests";
    const REPLIES: &str = "dispatcher-replies";

    enum Behaviour {
        Echo,
        Fail,
        Panic,
    }

    struct Stub(Behaviour);

    #[async_trait]
    impl PageFetcher for Stub {
        async fn fetch(
            &self,
            url: &str,
            _options: &FetchOptions,
        ) -> std::result::Result<String, FetchError> {
            match self.0 {
                Behaviour::Echo => Ok(format!("<html>{url}</html>")),
                Behaviour::Fail => Err(FetchError::new("timeout", "selector never appeared")),
                Behaviour::Panic => panic!("renderer crashed"),
            }
        }
    }

    struct Gated {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PageFetcher for Gated {
        async fn fetch(
            &self,
            _url: &str,
            _options: &FetchOptions,
        ) -> std::result::Result<String, FetchError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok("done".to_string())
        }
    }

    async fn setup(
        fetcher: Arc<dyn PageFetcher>,
        config: DispatcherConfig,
    ) -> (MemoryBroker, Dispatcher) {
        let broker = MemoryBroker::new();
        broker.declare_queue(REQUESTS, true).await.expect("declare");
        broker.declare_queue(REPLIES, false).await.expect("declare");
        let dispatcher = Dispatcher::new(
            Arc::new(broker.clone()),
            fetcher,
            config.with_queue(REQUESTS),
        )
        .expect("dispatcher");
        (broker, dispatcher)
    }

    async fn request(broker: &MemoryBroker, url: &str, id: &str) {
        let body = encode_request(url, &FetchOptions::new()).expect("encode");
        let envelope = Envelope::new(body)
            .with_correlation_id(id)
            .with_reply_to(REPLIES);
        broker.publish(REQUESTS, envelope).await.expect("publish");
    }

    async fn next_delivery(broker: &MemoryBroker, queue: &str) -> Delivery {
        let mut stream = broker.consume(queue, 0).await.expect("consume");
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery in time")
            .expect("item")
            .expect("delivery")
    }

    async fn next_reply(broker: &MemoryBroker) -> (Option<String>, Reply) {
        let delivery = next_delivery(broker, REPLIES).await;
        let reply = decode_reply(&delivery.envelope.body).expect("reply");
        let id = delivery.envelope.correlation_id.clone();
        delivery.ack().await.expect("ack");
        (id, reply)
    }

    #[tokio::test]
    async fn test_success_is_replied_then_acked() {
        let (broker, dispatcher) =
            setup(Arc::new(Stub(Behaviour::Echo)), DispatcherConfig::new()).await;
        request(&broker, "https://a.test", "id-1").await;

        let delivery = next_delivery(&broker, REQUESTS).await;
        let disposition = dispatcher.on_message(delivery).await.expect("handled");
        assert_eq!(disposition, Disposition::Replied);
        assert_eq!(broker.queue_len(REQUESTS), 0);

        let (id, reply) = next_reply(&broker).await;
        assert_eq!(id.as_deref(), Some("id-1"));
        assert_eq!(reply.url, "https://a.test");
        assert_eq!(reply.html(), Some("<html>https://a.test</html>"));
    }

    #[tokio::test]
    async fn test_fetch_failure_becomes_failure_reply() {
        let (broker, dispatcher) =
            setup(Arc::new(Stub(Behaviour::Fail)), DispatcherConfig::new()).await;
        request(&broker, "https://a.test", "id-1").await;

        let delivery = next_delivery(&broker, REQUESTS).await;
        assert_eq!(
            dispatcher.on_message(delivery).await.expect("handled"),
            Disposition::Replied
        );

        let (_, reply) = next_reply(&broker).await;
        assert_eq!(
            reply.outcome,
            FetchOutcome::failure("timeout", "selector never appeared")
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_failure_reply() {
        let (broker, dispatcher) =
            setup(Arc::new(Stub(Behaviour::Panic)), DispatcherConfig::new()).await;
        request(&broker, "https://a.test", "id-1").await;

        let delivery = next_delivery(&broker, REQUESTS).await;
        dispatcher.on_message(delivery).await.expect("handled");

        let (_, reply) = next_reply(&broker).await;
        assert_eq!(reply.outcome, FetchOutcome::failure(PANIC_KIND, "renderer crashed"));
    }

    #[tokio::test]
    async fn test_malformed_request_gets_failure_reply() {
        let (broker, dispatcher) =
            setup(Arc::new(Stub(Behaviour::Echo)), DispatcherConfig::new()).await;
        let envelope = Envelope::new(b"https://a.test*params={}".to_vec())
            .with_correlation_id("id-bad")
            .with_reply_to(REPLIES);
        broker.publish(REQUESTS, envelope).await.expect("publish");

        let delivery = next_delivery(&broker, REQUESTS).await;
        assert_eq!(
            dispatcher.on_message(delivery).await.expect("handled"),
            Disposition::RepliedMalformed
        );
        assert_eq!(broker.queue_len(REQUESTS), 0);

        let (id, reply) = next_reply(&broker).await;
        assert_eq!(id.as_deref(), Some("id-bad"));
        match reply.outcome {
            FetchOutcome::Failure { kind, .. } => assert_eq!(kind, MALFORMED_KIND),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_request_dropped_when_disabled() {
        let config = DispatcherConfig::new().with_reply_on_malformed(false);
        let (broker, dispatcher) = setup(Arc::new(Stub(Behaviour::Echo)), config).await;
        let envelope = Envelope::new(b"garbage".to_vec())
            .with_correlation_id("id-bad")
            .with_reply_to(REPLIES);
        broker.publish(REQUESTS, envelope).await.expect("publish");

        let delivery = next_delivery(&broker, REQUESTS).await;
        assert_eq!(
            dispatcher.on_message(delivery).await.expect("handled"),
            Disposition::Dropped
        );
        assert_eq!(broker.queue_len(REQUESTS), 0);
        assert_eq!(broker.queue_len(REPLIES), 0);
    }

    #[tokio::test]
    async fn test_malformed_request_without_reply_to_is_dropped() {
        let (broker, dispatcher) =
            setup(Arc::new(Stub(Behaviour::Echo)), DispatcherConfig::new()).await;
        broker
            .publish(REQUESTS, Envelope::new(b"garbage".to_vec()))
            .await
            .expect("publish");

        let delivery = next_delivery(&broker, REQUESTS).await;
        assert_eq!(
            dispatcher.on_message(delivery).await.expect("handled"),
            Disposition::Dropped
        );
        assert_eq!(broker.queue_len(REPLIES), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_requeues_request() {
        let (broker, dispatcher) =
            setup(Arc::new(Stub(Behaviour::Echo)), DispatcherConfig::new()).await;
        request(&broker, "https://a.test", "id-1").await;

        let delivery = next_delivery(&broker, REQUESTS).await;
        broker.close().await.expect("close");

        assert_eq!(
            dispatcher.on_message(delivery).await.expect("settled"),
            Disposition::Requeued
        );
        assert_eq!(broker.queue_len(REQUESTS), 1);
    }

    #[tokio::test]
    async fn test_run_until_drains_in_flight() {
        let gated = Arc::new(Gated {
            started: Notify::new(),
            release: Notify::new(),
        });
        let (broker, dispatcher) = setup(gated.clone(), DispatcherConfig::new()).await;
        request(&broker, "https://a.test", "id-1").await;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let worker = tokio::spawn(async move {
            dispatcher
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        gated.started.notified().await;
        stop_tx.send(()).expect("stop");
        tokio::task::yield_now().await;
        assert!(!worker.is_finished());

        gated.release.notify_one();
        timeout(Duration::from_secs(1), worker)
            .await
            .expect("stopped in time")
            .expect("join")
            .expect("clean stop");

        let (id, reply) = next_reply(&broker).await;
        assert_eq!(id.as_deref(), Some("id-1"));
        assert_eq!(reply.html(), Some("done"));
    }

    /// Delivers without any broker-side prefetch bound.
    struct Unbounded(MemoryBroker);

    #[async_trait]
    impl Transport for Unbounded {
        async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
            self.0.declare_queue(name, durable).await
        }

        async fn declare_reply_queue(&self) -> Result<String> {
            self.0.declare_reply_queue().await
        }

        async fn consume(&self, queue: &str, _prefetch: u16) -> Result<DeliveryStream> {
            self.0.consume(queue, 0).await
        }

        async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()> {
            self.0.publish(queue, envelope).await
        }

        async fn close(&self) -> Result<()> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_while_slots_full_leaves_backlog() {
        let gated = Arc::new(Gated {
            started: Notify::new(),
            release: Notify::new(),
        });
        let broker = MemoryBroker::new();
        broker.declare_queue(REQUESTS, true).await.expect("declare");
        broker.declare_queue(REPLIES, false).await.expect("declare");
        let dispatcher = Dispatcher::new(
            Arc::new(Unbounded(broker.clone())),
            gated.clone(),
            DispatcherConfig::new().with_queue(REQUESTS).with_prefetch(1),
        )
        .expect("dispatcher");

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let worker = tokio::spawn(async move {
            dispatcher
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        request(&broker, "https://a.test", "id-1").await;
        request(&broker, "https://b.test", "id-2").await;
        gated.started.notified().await;

        stop_tx.send(()).expect("stop");
        tokio::task::yield_now().await;
        gated.release.notify_one();

        timeout(Duration::from_secs(1), worker)
            .await
            .expect("stopped in time")
            .expect("join")
            .expect("clean stop");

        let (id, _) = next_reply(&broker).await;
        assert_eq!(id.as_deref(), Some("id-1"));
        assert_eq!(broker.queue_len(REPLIES), 0);
        assert_eq!(broker.queue_len(REQUESTS), 1);
    }

    #[tokio::test]
    async fn test_run_reports_closed_broker() {
        let (broker, dispatcher) =
            setup(Arc::new(Stub(Behaviour::Echo)), DispatcherConfig::new()).await;
        let worker = tokio::spawn(async move { dispatcher.run().await });

        tokio::task::yield_now().await;
        broker.close().await.expect("close");

        let result = timeout(Duration::from_secs(1), worker)
            .await
            .expect("stopped in time")
            .expect("join");
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_new_rejects_zero_prefetch() {
        let result = Dispatcher::new(
            Arc::new(MemoryBroker::new()),
            Arc::new(Stub(Behaviour::Echo)),
            DispatcherConfig::new().with_prefetch(0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_panic_message_variants() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "fetcher panicked");
    }
}
