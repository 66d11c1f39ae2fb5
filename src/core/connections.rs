//! Connection table keyed by (source, destination, protocol).

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::packet::{PacketRecord, Protocol};

/// Aggregated traffic for one (source, destination, protocol) key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    #[serde(rename = "src_ip")]
    pub source: IpAddr,
    #[serde(rename = "dst_ip")]
    pub destination: IpAddr,
    pub protocol: Protocol,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packet_count: u64,
    pub bytes_transferred: u64,
}

/// Connection table with optional caps on records kept per source and on
/// the number of sources held.
///
/// Sources are remembered in first-seen order so snapshots are stable.
#[derive(Debug)]
pub struct ConnectionTable {
    per_source_cap: Option<usize>,
    max_sources: Option<usize>,
    by_source: HashMap<IpAddr, Vec<ConnectionRecord>>,
    source_order: Vec<IpAddr>,
    evicted: u64,
    evicted_sources: u64,
}

impl ConnectionTable {
    /// Table that keeps at most `per_source_cap` records for each of at most
    /// `max_sources` sources. Past either cap the least recently seen record
    /// or source makes room for the new one.
    pub fn bounded(per_source_cap: usize, max_sources: usize) -> Self {
        Self {
            per_source_cap: Some(per_source_cap.max(1)),
            max_sources: Some(max_sources.max(1)),
            ..Self::unbounded()
        }
    }

    pub fn unbounded() -> Self {
        Self {
            per_source_cap: None,
            max_sources: None,
            by_source: HashMap::new(),
            source_order: Vec::new(),
            evicted: 0,
            evicted_sources: 0,
        }
    }

    fn evict_stalest_source(&mut self) {
        let stalest = self
            .source_order
            .iter()
            .enumerate()
            .min_by_key(|(_, source)| {
                self.by_source
                    .get(*source)
                    .and_then(|records| records.iter().map(|r| r.last_seen).max())
            })
            .map(|(idx, _)| idx);
        if let Some(idx) = stalest {
            let source = self.source_order.remove(idx);
            self.by_source.remove(&source);
            self.evicted_sources += 1;
        }
    }

    /// Create or update the record for the packet's key.
    /// Returns `true` when a new record was created, `false` on update or
    /// when the packet has no addresses.
    pub fn record(&mut self, packet: &PacketRecord) -> bool {
        let (source, destination) = match (packet.source(), packet.destination()) {
            (Some(source), Some(destination)) => (source, destination),
            _ => return false,
        };
        let protocol = packet.protocol();

        if !self.by_source.contains_key(&source) {
            if let Some(max) = self.max_sources {
                while self.source_order.len() >= max {
                    self.evict_stalest_source();
                }
            }
            self.source_order.push(source);
        }
        let records = self.by_source.entry(source).or_default();

        if let Some(existing) = records
            .iter_mut()
            .find(|r| r.destination == destination && r.protocol == protocol)
        {
            existing.packet_count += 1;
            existing.bytes_transferred += packet.size as u64;
            if packet.timestamp > existing.last_seen {
                existing.last_seen = packet.timestamp;
            }
            return false;
        }

        if let Some(cap) = self.per_source_cap {
            if records.len() >= cap {
                let oldest = records
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, r)| r.last_seen)
                    .map(|(idx, _)| idx);
                if let Some(idx) = oldest {
                    records.remove(idx);
                    self.evicted += 1;
                }
            }
        }

        records.push(ConnectionRecord {
            source,
            destination,
            protocol,
            first_seen: packet.timestamp,
            last_seen: packet.timestamp,
            packet_count: 1,
            bytes_transferred: packet.size as u64,
        });
        true
    }

    /// Records of at most `max_sources` sources, in first-seen order
    pub fn snapshot(&self, max_sources: usize) -> Vec<ConnectionRecord> {
        self.source_order
            .iter()
            .take(max_sources)
            .filter_map(|source| self.by_source.get(source))
            .flat_map(|records| records.iter().cloned())
            .collect()
    }

    /// All records, in first-seen source order
    pub fn records(&self) -> Vec<ConnectionRecord> {
        self.snapshot(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.by_source.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    pub fn source_count(&self) -> usize {
        self.source_order.len()
    }

    /// Records dropped because their source hit the cap
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Sources dropped because the table held too many
    pub fn evicted_sources(&self) -> u64 {
        self.evicted_sources
    }

    pub fn clear(&mut self) {
        self.by_source.clear();
        self.source_order.clear();
        self.evicted = 0;
        self.evicted_sources = 0;
    }
}
