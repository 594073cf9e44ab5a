//! AMQP transport: topology declaration, publishing, and consumers.
//!
//! Each work queue is durable, priority-enabled, and dead-letters into its
//! `*.retry` companion; the companion carries the retry TTL and dead-letters
//! straight back. Per-message expirations published into the companion
//! implement longer, per-attempt backoff on top of the queue-level TTL.

use futures_util::StreamExt as _;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::time::Duration;

use super::{Priority, QueueName};

/// Highest priority value the work queues accept.
const MAX_PRIORITY: u8 = 10;

/// Header carrying the delivery attempt count across redeliveries.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Deadline for the connect + topology handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A live AMQP connection with the gateway topology declared.
pub struct Broker {
    connection: Connection,
    channel: Channel,
}

impl Broker {
    /// Connect, open the process channel, and declare every queue pair.
    pub async fn connect(url: &str, retry_ttl: Duration) -> Result<Self, lapin::Error> {
        tokio::time::timeout(CONNECT_TIMEOUT, Self::connect_inner(url, retry_ttl))
            .await
            .map_err(|_| {
                lapin::Error::InvalidConnectionState(lapin::ConnectionState::Error)
            })?
    }

    async fn connect_inner(url: &str, retry_ttl: Duration) -> Result<Self, lapin::Error> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        for queue in QueueName::ALL {
            Self::declare_pair(&channel, queue, retry_ttl).await?;
        }
        Ok(Self {
            connection,
            channel,
        })
    }

    async fn declare_pair(
        channel: &Channel,
        queue: QueueName,
        retry_ttl: Duration,
    ) -> Result<(), lapin::Error> {
        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        let mut work_args = FieldTable::default();
        work_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString("".into()),
        );
        work_args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(queue.retry_name().into()),
        );
        work_args.insert(
            ShortString::from("x-max-priority"),
            AMQPValue::ShortShortUInt(MAX_PRIORITY),
        );
        channel
            .queue_declare(queue.as_str(), durable, work_args)
            .await?;

        let mut retry_args = FieldTable::default();
        retry_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString("".into()),
        );
        retry_args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(queue.as_str().into()),
        );
        retry_args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongUInt(retry_ttl.as_millis().min(u32::MAX as u128) as u32),
        );
        channel
            .queue_declare(queue.retry_name(), durable, retry_args)
            .await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Publish a persistent message to a work queue.
    pub async fn publish(
        &self,
        queue: QueueName,
        body: &[u8],
        priority: Priority,
        retry_count: u32,
    ) -> Result<(), lapin::Error> {
        self.publish_to(queue.as_str(), body, priority, retry_count, None)
            .await
    }

    /// Publish into the retry companion with a per-message expiration, so
    /// the message dead-letters back to the work queue after `delay`.
    pub async fn publish_delayed(
        &self,
        queue: QueueName,
        body: &[u8],
        priority: Priority,
        retry_count: u32,
        delay: Duration,
    ) -> Result<(), lapin::Error> {
        self.publish_to(queue.retry_name(), body, priority, retry_count, Some(delay))
            .await
    }

    async fn publish_to(
        &self,
        routing_key: &str,
        body: &[u8],
        priority: Priority,
        retry_count: u32,
        expiration: Option<Duration>,
    ) -> Result<(), lapin::Error> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(RETRY_COUNT_HEADER),
            AMQPValue::LongUInt(retry_count),
        );
        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_priority(priority.amqp())
            .with_headers(headers);
        if let Some(delay) = expiration {
            properties = properties.with_expiration(delay.as_millis().to_string().into());
        }
        self.channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    /// Open a consumer on a work queue with the given prefetch window.
    pub async fn start_consumer(
        &self,
        queue: QueueName,
        prefetch: u16,
    ) -> Result<Consumer, lapin::Error> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        self.channel
            .basic_consume(
                queue.as_str(),
                &format!("paygate-{}", queue.as_str()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
    }
}

/// Attempt count recorded on a delivery, defaulting to zero.
pub fn delivery_retry_count(delivery: &lapin::message::Delivery) -> u32 {
    delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|table| {
            table
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == RETRY_COUNT_HEADER)
                .map(|(_, value)| value)
        })
        .and_then(|value| match value {
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::ShortUInt(n) => Some(*n as u32),
            _ => None,
        })
        .unwrap_or(0)
}

/// Acknowledge a delivery, logging instead of failing on a dead channel;
/// an unacked message is simply redelivered, which handlers tolerate.
pub async fn ack_or_log(delivery: &lapin::message::Delivery) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        tracing::warn!(error = %e, "failed to ack delivery; it will be redelivered");
    }
}

/// Drain a consumer into a stream of deliveries, stopping on channel error.
pub async fn next_delivery(
    consumer: &mut Consumer,
) -> Option<Result<lapin::message::Delivery, lapin::Error>> {
    consumer.next().await
}
