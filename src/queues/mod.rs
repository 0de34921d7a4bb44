//! AMQP plumbing: one topic exchange, three submanagers.
//!
//! The account submanager is static; the order and position
//! submanagers bind their per-account queues when an account is
//! created and tear them down when it is deleted. Every consuming
//! channel runs prefetch 1; consumer tags are UUIDs fixed at
//! construction; replies copy the request's correlation id.

pub mod account;
pub mod order;
pub mod position;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, Consumer, ExchangeKind};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

pub use account::AccountQueueManager;
pub use order::OrderQueueManager;
pub use position::PositionQueueManager;

/// Idle expiry for per-account queues (broker-side `x-expires`).
pub const QUEUE_EXPIRATION_TIME_MS: i64 = 1_800_000;
/// TTL on heartbeat messages so undelivered beats age out.
pub const MESSAGE_EXPIRATION_SECONDS: u64 = 20;

pub(crate) async fn create_channel(connection: &Connection, prefetch_one: bool) -> Result<Channel> {
    let channel = connection.create_channel().await?;
    if prefetch_one {
        channel
            .basic_qos(1, lapin::options::BasicQosOptions::default())
            .await?;
    }
    Ok(channel)
}

pub(crate) async fn declare_topic_exchange(channel: &Channel, name: &str) -> Result<()> {
    channel
        .exchange_declare(
            name,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

pub(crate) async fn declare_durable_queue(
    channel: &Channel,
    name: &str,
    expires_ms: Option<i64>,
) -> Result<()> {
    let mut arguments = FieldTable::default();
    if let Some(expires) = expires_ms {
        arguments.insert("x-expires".into(), AMQPValue::LongLongInt(expires));
    }
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            arguments,
        )
        .await?;
    Ok(())
}

pub(crate) async fn bind_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<()> {
    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

pub(crate) async fn start_consumer(channel: &Channel, queue: &str, tag: &str) -> Result<Consumer> {
    Ok(channel
        .basic_consume(
            queue,
            tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?)
}

/// Drive a consumer until the broker cancels it or the channel dies.
pub(crate) fn spawn_consumer<F, Fut>(mut consumer: Consumer, handle_delivery: F) -> JoinHandle<()>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(next) = consumer.next().await {
            match next {
                Ok(delivery) => handle_delivery(delivery).await,
                Err(error) => {
                    warn!(%error, "consumer stream error");
                    break;
                }
            }
        }
    })
}

/// Best-effort teardown: purge, unbind, delete, tolerating channels
/// already torn down underneath us.
pub(crate) async fn cleanup_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) {
    if let Err(error) = channel
        .queue_purge(queue, QueuePurgeOptions::default())
        .await
    {
        debug!(queue, %error, "queue purge failed");
    }
    if let Err(error) = channel
        .queue_unbind(queue, exchange, routing_key, FieldTable::default())
        .await
    {
        debug!(queue, %error, "queue unbind failed");
    }
    if let Err(error) = channel
        .queue_delete(queue, QueueDeleteOptions::default())
        .await
    {
        debug!(queue, %error, "queue delete failed");
    }
}

/// Publish a persistent JSON message, optionally correlated and with a
/// per-message TTL (milliseconds).
pub(crate) async fn publish_json(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &serde_json::Value,
    correlation_id: Option<&str>,
    expiration_ms: Option<u64>,
) -> Result<()> {
    let mut properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2);
    if let Some(correlation_id) = correlation_id {
        properties = properties.with_correlation_id(correlation_id.into());
    }
    if let Some(expiration_ms) = expiration_ms {
        properties = properties.with_expiration(expiration_ms.to_string().into());
    }

    channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            payload.to_string().as_bytes(),
            properties,
        )
        .await?
        .await?;
    Ok(())
}

pub(crate) async fn ack(delivery: &Delivery) {
    if let Err(error) = delivery.acker.ack(BasicAckOptions::default()).await {
        warn!(%error, "ack failed");
    }
}

pub(crate) fn correlation_id_of(delivery: &Delivery) -> String {
    delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default()
}

pub(crate) fn timestamp_of(delivery: &Delivery) -> Option<DateTime<Utc>> {
    (*delivery.properties.timestamp())
        .and_then(|seconds| DateTime::from_timestamp(seconds as i64, 0))
}

/// JSON number (or null) for an optional decimal; replies carry plain
/// numbers, not decimal strings.
pub(crate) fn decimal_json(value: Option<Decimal>) -> serde_json::Value {
    value
        .and_then(|decimal| decimal.to_f64())
        .map(serde_json::Value::from)
        .unwrap_or(serde_json::Value::Null)
}
