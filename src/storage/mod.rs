//! Persistence for attack events and ETL batches.
//!
//! Two contracts live here: [`AttackLog`] (append attack events, read them
//! back newest-first, summarise them) and [`RecordSink`] (insert-only batch
//! writes into a named collection). Each backend implements both.

pub mod file;
pub mod memory;
pub mod redis;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Timelike;
use serde::Serialize;
use thiserror::Error;

use crate::core::AttackEvent;
use crate::models::{Config, StorageBackend};

pub use self::file::{FileStore, LocalSnapshot};
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Events read when computing statistics
pub const STATISTICS_WINDOW: usize = 1000;

/// Errors that can occur while reading or writing a store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] ::redis::RedisError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Aggregates over the most recent attack events
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttackStatistics {
    pub total_attacks: usize,
    pub attack_types: BTreeMap<String, u64>,
    /// Ten most frequent sources, most frequent first
    pub top_source_ips: Vec<(IpAddr, u64)>,
    /// Ten most frequent destinations, most frequent first
    pub top_destination_ips: Vec<(IpAddr, u64)>,
    /// Event count per hour of day (UTC)
    pub attacks_by_hour: BTreeMap<u32, u64>,
    pub recent_attacks: Vec<AttackEvent>,
}

impl AttackStatistics {
    /// Summarise events that are already ordered newest first
    pub fn from_events(events: Vec<AttackEvent>) -> Self {
        let mut attack_types = BTreeMap::new();
        let mut sources: BTreeMap<IpAddr, u64> = BTreeMap::new();
        let mut destinations: BTreeMap<IpAddr, u64> = BTreeMap::new();
        let mut attacks_by_hour = BTreeMap::new();

        for event in &events {
            *attack_types.entry(event.attack_type.to_string()).or_insert(0) += 1;
            *sources.entry(event.source).or_insert(0) += 1;
            *destinations.entry(event.destination).or_insert(0) += 1;
            *attacks_by_hour.entry(event.timestamp.hour()).or_insert(0) += 1;
        }

        Self {
            total_attacks: events.len(),
            attack_types,
            top_source_ips: top_n(sources, 10),
            top_destination_ips: top_n(destinations, 10),
            attacks_by_hour,
            recent_attacks: events.into_iter().take(10).collect(),
        }
    }
}

fn top_n(counts: BTreeMap<IpAddr, u64>, n: usize) -> Vec<(IpAddr, u64)> {
    let mut ranked: Vec<(IpAddr, u64)> = counts.into_iter().collect();
    // Stable sort keeps address order among equal counts.
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.truncate(n);
    ranked
}

/// Attack event log
#[async_trait]
pub trait AttackLog: Send + Sync {
    /// Append one event
    async fn log_attack(&self, event: &AttackEvent) -> Result<(), StoreError>;

    /// Up to `limit` events, newest first
    async fn recent(&self, limit: usize) -> Result<Vec<AttackEvent>, StoreError>;

    /// Remove every logged event
    async fn clear(&self) -> Result<(), StoreError>;

    /// Statistics over the latest [`STATISTICS_WINDOW`] events
    async fn statistics(&self) -> Result<AttackStatistics, StoreError> {
        let events = self.recent(STATISTICS_WINDOW).await?;
        Ok(AttackStatistics::from_events(events))
    }
}

/// Insert-only batch sink for ETL output
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Insert every record into `collection`. Records are never upserted.
    async fn insert_batch(
        &self,
        collection: &str,
        records: &[serde_json::Value],
    ) -> Result<(), StoreError>;
}

/// The configured backend, seen through both contracts
#[derive(Clone)]
pub struct StoreHandles {
    pub attack_log: Arc<dyn AttackLog>,
    pub sink: Arc<dyn RecordSink>,
}

impl StoreHandles {
    pub fn from_store<T: AttackLog + RecordSink + 'static>(store: Arc<T>) -> Self {
        Self {
            attack_log: store.clone(),
            sink: store,
        }
    }
}

/// Build the configured backend
pub fn open_store(config: &Config) -> Result<StoreHandles, StoreError> {
    let handles = match config.storage.backend {
        StorageBackend::File => StoreHandles::from_store(Arc::new(FileStore::new(
            config.storage.log_file.clone(),
            config.storage.data_dir.clone(),
        ))),
        StorageBackend::Redis => StoreHandles::from_store(Arc::new(RedisStore::new(&config.redis)?)),
        StorageBackend::Memory => StoreHandles::from_store(Arc::new(MemoryStore::new())),
    };
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttackType, Classification, Severity};
    use chrono::{TimeZone, Utc};

    fn event(src: &str, dst: &str, hour: u32) -> AttackEvent {
        AttackEvent::new(
            AttackType::SynFlood,
            src.parse().unwrap(),
            dst.parse().unwrap(),
            Severity::High,
            5,
            Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            Classification {
                classification: "DoS".into(),
                confidence: 90,
                description: String::new(),
                impact: String::new(),
                mitigation: String::new(),
            },
        )
    }

    #[test]
    fn test_statistics_from_events() {
        let events = vec![
            event("10.0.0.5", "10.0.0.1", 3),
            event("10.0.0.5", "10.0.0.2", 3),
            event("10.0.0.6", "10.0.0.1", 14),
        ];
        let stats = AttackStatistics::from_events(events);

        assert_eq!(stats.total_attacks, 3);
        assert_eq!(stats.attack_types.get("SYN Flood"), Some(&3));
        assert_eq!(stats.top_source_ips[0], ("10.0.0.5".parse().unwrap(), 2));
        assert_eq!(stats.top_destination_ips[0], ("10.0.0.1".parse().unwrap(), 2));
        assert_eq!(stats.attacks_by_hour.get(&3), Some(&2));
        assert_eq!(stats.recent_attacks.len(), 3);
    }
}
