//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! Uses the default exchange, so the routing key of every publish is the
//! destination queue name. One connection and one channel per transport;
//! the channel carries both the consumers and the publishes.
//!
//! # Example
//!
//! ```no_run
//! use scraper_rpc::BrokerConfig;
//! use scraper_rpc::transport::{AmqpTransport, Transport};
//!
//! # async fn example() -> scraper_rpc::Result<()> {
//! let transport = AmqpTransport::connect(&BrokerConfig::from_env()).await?;
//! transport.declare_queue("scraper_api_queue", true).await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};

use super::{Acknowledger, Delivery, DeliveryStream, Envelope, Transport};

// ============================================================================
// AmqpTransport
// ============================================================================

/// Transport over a RabbitMQ (or compatible) broker.
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
}

impl AmqpTransport {
    /// Connects to the broker and opens a channel.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if the broker does not answer in time
    /// - [`Error::Amqp`] if the handshake fails
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        debug!(uri = %config.redacted_uri(), "Connecting to broker");

        let connection = timeout(
            config.connect_timeout,
            Connection::connect(&config.uri, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| Error::connection_timeout(config.connect_timeout.as_millis() as u64))??;

        let channel = connection.create_channel().await?;

        info!(uri = %config.redacted_uri(), "Connected to broker");

        Ok(Self {
            connection,
            channel,
        })
    }

    /// Returns the underlying channel.
    #[inline]
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!(
            queue = %queue.name().as_str(),
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Declared queue"
        );
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let name = queue.name().as_str().to_string();
        debug!(queue = %name, "Declared reply queue");
        Ok(name)
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        if prefetch > 0 {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await?;
        }

        let consumer_tag = format!("scraper-rpc-{}", Uuid::new_v4().simple());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "Consuming");

        let stream = consumer.map(|item| {
            item.map(into_delivery).map_err(Error::from)
        });

        Ok(Box::pin(stream))
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()> {
        let mut properties = BasicProperties::default();
        if let Some(id) = envelope.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id));
        }
        if let Some(reply_to) = envelope.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to));
        }
        if let Some(content_type) = envelope.content_type {
            properties = properties.with_content_type(ShortString::from(content_type));
        }

        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await?
            .await?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(200, "OK").await?;
        info!("Broker connection closed");
        Ok(())
    }
}

// ============================================================================
// Conversions
// ============================================================================

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let correlation_id = short_string(properties.correlation_id());
    let reply_to = short_string(properties.reply_to());
    let content_type = short_string(properties.content_type());

    let envelope = Envelope {
        body: delivery.data,
        correlation_id,
        reply_to,
        content_type,
    };

    Delivery::new(
        envelope,
        delivery.redelivered,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

fn short_string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

// ============================================================================
// AmqpAcker
// ============================================================================

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}
