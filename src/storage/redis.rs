//! Redis-backed store.
//!
//! Attack events are JSON strings in the list `<prefix>:attacks`, pushed at
//! the head so `LRANGE 0 n` reads newest first. Each ETL collection is the
//! list `<prefix>:<collection>`, appended at the tail.

use async_trait::async_trait;
use log::{debug, info};
use redis::Client as RedisClient;

use crate::core::AttackEvent;
use crate::models::RedisConfig;
use crate::storage::{AttackLog, RecordSink, StoreError};

/// Store writing to a Redis server
pub struct RedisStore {
    client: RedisClient,
    key_prefix: String,
}

impl RedisStore {
    /// Create a store for the configured server. No connection is made until first use.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = RedisClient::open(config.url.as_str())?;
        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn attacks_key(&self) -> String {
        format!("{}:attacks", self.key_prefix)
    }

    fn collection_key(&self, collection: &str) -> String {
        format!("{}:{}", self.key_prefix, collection)
    }
}

#[async_trait]
impl AttackLog for RedisStore {
    async fn log_attack(&self, event: &AttackEvent) -> Result<(), StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let event_json = serde_json::to_string(event)?;

        redis::cmd("LPUSH")
            .arg(self.attacks_key())
            .arg(event_json)
            .query_async::<_, ()>(&mut conn)
            .await?;

        info!("Logged attack: {} from {}", event.attack_type, event.source);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AttackEvent>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.client.get_async_connection().await?;

        let json_strs: Vec<String> = redis::cmd("LRANGE")
            .arg(self.attacks_key())
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await?;

        let mut events = Vec::with_capacity(json_strs.len());
        for json_str in json_strs {
            match serde_json::from_str::<AttackEvent>(&json_str) {
                Ok(event) => events.push(event),
                Err(e) => debug!("Skipping unreadable attack entry: {}", e),
            }
        }
        Ok(events)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("DEL")
            .arg(self.attacks_key())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for RedisStore {
    async fn insert_batch(
        &self,
        collection: &str,
        records: &[serde_json::Value],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let values = records
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<String>, _>>()?;

        let mut conn = self.client.get_async_connection().await?;
        let key = self.collection_key(collection);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("RPUSH")
            .arg(&key)
            .arg(values)
            .ignore()
            .cmd("HINCRBY")
            .arg(format!("{}:collections", self.key_prefix))
            .arg(collection)
            .arg(records.len())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!("Inserted {} records into {}", records.len(), key);
        Ok(())
    }
}
