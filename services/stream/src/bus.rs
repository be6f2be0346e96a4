//! Shared market event bus
//!
//! One pub/sub channel carries every envelope from the publisher process
//! to all gateway instances. Payloads that fail to decode are skipped,
//! never fatal: a bad message must not take a listener down.

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use types::stream::BusMessage;

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error("encode failure: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait MarketEventPublisher: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError>;
    async fn close(&self) -> Result<(), BusError>;
}

#[async_trait]
pub trait MarketEventSubscriber: Send + Sync {
    /// Run one subscription, forwarding decoded envelopes to `tx` until
    /// the stop signal fires or the connection drops. Returning `Ok` after
    /// a drop lets the caller decide whether to reconnect.
    async fn listen(
        &self,
        stop: watch::Receiver<bool>,
        tx: mpsc::Sender<BusMessage>,
    ) -> Result<(), BusError>;
}

/// Publishes envelopes onto one Redis pub/sub channel, holding a lazy
/// multiplexed connection.
pub struct RedisEventPublisher {
    client: redis::Client,
    channel: String,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisEventPublisher {
    pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self, BusError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            channel: channel.into(),
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BusError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl MarketEventPublisher for RedisEventPublisher {
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.connection().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!(channel = %self.channel, receivers, "published bus message");
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.conn.lock().await.take();
        Ok(())
    }
}

/// Subscribes to the bus channel over a dedicated pub/sub connection.
pub struct RedisEventSubscriber {
    client: redis::Client,
    channel: String,
}

impl RedisEventSubscriber {
    pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self, BusError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            channel: channel.into(),
        })
    }
}

#[async_trait]
impl MarketEventSubscriber for RedisEventSubscriber {
    async fn listen(
        &self,
        mut stop: watch::Receiver<bool>,
        tx: mpsc::Sender<BusMessage>,
    ) -> Result<(), BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                message = stream.next() => {
                    let Some(message) = message else {
                        // Connection dropped; let the caller restart us.
                        return Ok(());
                    };
                    let Some(decoded) = decode_bus_payload(message.get_payload_bytes()) else {
                        continue;
                    };
                    if tx.send(decoded).await.is_err() {
                        return Ok(());
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Decode one raw bus payload, returning `None` for anything malformed.
pub fn decode_bus_payload(raw: &[u8]) -> Option<BusMessage> {
    match serde_json::from_slice::<BusMessage>(raw) {
        Ok(message) => Some(message),
        Err(error) => {
            warn!(%error, "dropping undecodable bus payload");
            None
        }
    }
}
