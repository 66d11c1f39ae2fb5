//! Attack events emitted by the detectors.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::packet::{PacketRecord, Protocol, TcpFlags};

/// Kind of flood that triggered an event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AttackType {
    SynFlood,
    UdpFlood,
    /// Any other label, e.g. events read back from a store written by another tool
    Other(String),
}

impl AttackType {
    pub fn as_str(&self) -> &str {
        match self {
            AttackType::SynFlood => "SYN Flood",
            AttackType::UdpFlood => "UDP Flood",
            AttackType::Other(name) => name,
        }
    }
}

impl fmt::Display for AttackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for AttackType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "SYN Flood" => AttackType::SynFlood,
            "UDP Flood" => AttackType::UdpFlood,
            _ => AttackType::Other(value),
        }
    }
}

impl From<AttackType> for String {
    fn from(value: AttackType) -> Self {
        value.as_str().to_string()
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Enrichment returned by a classifier (or the static fallback table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Human-readable category, e.g. "Denial of Service (DoS) - SYN Flood"
    pub classification: String,
    /// Confidence in percent (0-100)
    pub confidence: u8,
    pub description: String,
    pub impact: String,
    pub mitigation: String,
}

/// Packet-level details attached to an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketDetails {
    pub size: u32,
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<TcpFlags>,
}

impl From<&PacketRecord> for PacketDetails {
    fn from(packet: &PacketRecord) -> Self {
        Self {
            size: packet.size,
            protocol: packet.protocol(),
            port: packet.dst_port(),
            flags: packet.tcp_flags(),
        }
    }
}

/// A detected attack. Created once per detection trigger and never mutated after it is logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackEvent {
    /// Event ID
    pub id: Uuid,
    /// Attack type
    pub attack_type: AttackType,
    /// Offending address
    #[serde(rename = "source_ip")]
    pub source: IpAddr,
    /// Targeted address
    #[serde(rename = "destination_ip")]
    pub destination: IpAddr,
    pub severity: Severity,
    /// Number of packets counted by the detector when it fired
    pub packet_count: u64,
    pub timestamp: DateTime<Utc>,
    pub classification: String,
    pub confidence: u8,
    pub description: String,
    pub impact: String,
    pub mitigation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<PacketDetails>,
}

impl AttackEvent {
    /// Build an event from a detection and its classification
    pub fn new(
        attack_type: AttackType,
        source: IpAddr,
        destination: IpAddr,
        severity: Severity,
        packet_count: u64,
        timestamp: DateTime<Utc>,
        classification: Classification,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            attack_type,
            source,
            destination,
            severity,
            packet_count,
            timestamp,
            classification: classification.classification,
            confidence: classification.confidence,
            description: classification.description,
            impact: classification.impact,
            mitigation: classification.mitigation,
            details: None,
        }
    }

    pub fn with_details(mut self, details: PacketDetails) -> Self {
        self.details = Some(details);
        self
    }
}
