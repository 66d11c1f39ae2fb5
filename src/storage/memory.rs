//! In-process store, used for tests and when no persistence is wanted.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::AttackEvent;
use crate::storage::{AttackLog, RecordSink, StoreError};

/// Store that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Logged events, oldest first
    events: RwLock<Vec<AttackEvent>>,
    collections: RwLock<HashMap<String, Vec<serde_json::Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record inserted into `collection` so far
    pub async fn collection(&self, collection: &str) -> Vec<serde_json::Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl AttackLog for MemoryStore {
    async fn log_attack(&self, event: &AttackEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AttackEvent>, StoreError> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.events.write().await.clear();
        Ok(())
    }
}

#[async_trait]
impl RecordSink for MemoryStore {
    async fn insert_batch(
        &self,
        collection: &str,
        records: &[serde_json::Value],
    ) -> Result<(), StoreError> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::fallback_classification;
    use crate::core::{AttackType, Severity};
    use chrono::Utc;
    use serde_json::json;

    fn event(src: &str) -> AttackEvent {
        let source = src.parse().unwrap();
        AttackEvent::new(
            AttackType::UdpFlood,
            source,
            "10.0.0.1".parse().unwrap(),
            Severity::Medium,
            11,
            Utc::now(),
            fallback_classification(&AttackType::UdpFlood, source),
        )
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let store = MemoryStore::new();
        store.log_attack(&event("10.0.0.5")).await.unwrap();
        store.log_attack(&event("10.0.0.6")).await.unwrap();
        store.log_attack(&event("10.0.0.7")).await.unwrap();

        let recent = store.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].source.to_string(), "10.0.0.7");
        assert_eq!(recent[1].source.to_string(), "10.0.0.6");

        store.clear().await.unwrap();
        assert!(store.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_batch_appends() {
        let store = MemoryStore::new();
        store
            .insert_batch("packets", &[json!({"index": 0}), json!({"index": 1})])
            .await
            .unwrap();
        store
            .insert_batch("packets", &[json!({"index": 0})])
            .await
            .unwrap();

        assert_eq!(store.collection("packets").await.len(), 3);
        assert!(store.collection("connections").await.is_empty());
    }
}
