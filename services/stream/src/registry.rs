//! Cluster topic registry
//!
//! Every gateway instance advertises the union of its clients' topics
//! under a TTL key (`<prefix>:<instance_id>`). The publisher scans the
//! prefix and unions all live values, so an instance that dies without
//! cleanup simply ages out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::warn;

use crate::bus::BusError;

pub const DEFAULT_KEY_PREFIX: &str = "market:stocks:subs";
pub const DEFAULT_TTL_SECONDS: u64 = 30;
const MIN_TTL_SECONDS: u64 = 5;
const SCAN_COUNT: usize = 200;

#[derive(Debug, Serialize, Deserialize)]
struct TopicsRecord {
    topics: Vec<String>,
}

#[async_trait]
pub trait TopicRegistry: Send + Sync {
    /// Advertise this instance's topic union, refreshing the TTL.
    async fn update_topics(
        &self,
        instance_id: &str,
        topics: &BTreeSet<String>,
    ) -> Result<(), BusError>;

    async fn delete_instance(&self, instance_id: &str) -> Result<(), BusError>;

    /// Union of topics advertised by all live instances.
    async fn collect_topics(&self) -> Result<BTreeSet<String>, BusError>;

    async fn close(&self) -> Result<(), BusError>;
}

pub struct RedisTopicRegistry {
    client: redis::Client,
    key_prefix: String,
    ttl_seconds: u64,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisTopicRegistry {
    pub fn new(
        redis_url: &str,
        key_prefix: impl Into<String>,
        ttl_seconds: u64,
    ) -> Result<Self, BusError> {
        let key_prefix = {
            let prefix = key_prefix.into();
            let trimmed = prefix.trim();
            if trimmed.is_empty() {
                DEFAULT_KEY_PREFIX.to_string()
            } else {
                trimmed.to_string()
            }
        };
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            key_prefix,
            ttl_seconds: ttl_seconds.max(MIN_TTL_SECONDS),
            conn: Mutex::new(None),
        })
    }

    fn key(&self, instance_id: &str) -> String {
        let normalized = instance_id.trim();
        let normalized = if normalized.is_empty() {
            "unknown"
        } else {
            normalized
        };
        format!("{}:{}", self.key_prefix, normalized)
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
impl TopicRegistry for RedisTopicRegistry {
    async fn update_topics(
        &self,
        instance_id: &str,
        topics: &BTreeSet<String>,
    ) -> Result<(), BusError> {
        let record = TopicsRecord {
            topics: topics
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        };
        let payload = serde_json::to_string(&record)?;
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.key(instance_id))
            .arg(payload)
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(instance_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn collect_topics(&self) -> Result<BTreeSet<String>, BusError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:*", self.key_prefix);

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut topics = BTreeSet::new();
        if keys.is_empty() {
            return Ok(topics);
        }
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        for value in values.into_iter().flatten() {
            topics.extend(decode_topics(&value));
        }
        Ok(topics)
    }

    async fn close(&self) -> Result<(), BusError> {
        self.conn.lock().await.take();
        Ok(())
    }
}

/// Decode one registry value; malformed values contribute nothing.
pub fn decode_topics(raw: &str) -> BTreeSet<String> {
    match serde_json::from_str::<TopicsRecord>(raw) {
        Ok(record) => record
            .topics
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        Err(error) => {
            warn!(%error, "dropping undecodable topic registry value");
            BTreeSet::new()
        }
    }
}
