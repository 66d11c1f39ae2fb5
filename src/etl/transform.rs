//! Transform phase: decode frames and derive packets, connections, per-IP
//! statistics and attack events.
//!
//! Attack detection here uses lifetime counters per source over the whole
//! run, independently of the streaming analyzer's sliding windows.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;

use crate::capture::{decode_frame, RawFrame};
use crate::core::attack::{AttackEvent, AttackType, PacketDetails, Severity};
use crate::core::classifier::fallback_classification;
use crate::core::connections::{ConnectionRecord, ConnectionTable};
use crate::core::packet::{PacketRecord, Protocol};
use crate::models::EtlConfig;

/// Per-run counters. `total_packets == processed_packets + failed_packets`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EtlStats {
    pub files_read: usize,
    pub total_packets: u64,
    pub processed_packets: u64,
    pub failed_packets: u64,
    pub connections_created: u64,
    pub attacks_detected: u64,
}

/// A decoded packet as stored in the `packets` collection
#[derive(Debug, Clone, Serialize)]
pub struct StoredPacket {
    /// Position of the frame in the extracted sequence
    pub index: usize,
    #[serde(flatten)]
    pub record: PacketRecord,
}

/// Traffic seen from and to one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpStatistics {
    pub packet_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub protocols: BTreeSet<Protocol>,
    pub ports: BTreeSet<u16>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub syn_packets: u64,
    pub udp_packets: u64,
}

impl IpStatistics {
    fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            packet_count: 0,
            bytes_sent: 0,
            bytes_received: 0,
            protocols: BTreeSet::new(),
            ports: BTreeSet::new(),
            first_seen: timestamp,
            last_seen: timestamp,
            syn_packets: 0,
            udp_packets: 0,
        }
    }

    fn touch(&mut self, packet: &PacketRecord) {
        self.packet_count += 1;
        self.protocols.insert(packet.protocol());
        if packet.timestamp < self.first_seen {
            self.first_seen = packet.timestamp;
        }
        if packet.timestamp > self.last_seen {
            self.last_seen = packet.timestamp;
        }
    }
}

/// Everything the transform phase derives from one run
#[derive(Debug, Default)]
pub struct TransformOutput {
    pub packets: Vec<StoredPacket>,
    pub connections: Vec<ConnectionRecord>,
    pub ip_statistics: BTreeMap<IpAddr, IpStatistics>,
    pub attacks: Vec<AttackEvent>,
}

/// Transform extracted frames. Undecodable frames are counted and skipped.
pub fn transform(frames: Vec<RawFrame>, config: &EtlConfig, stats: &mut EtlStats) -> TransformOutput {
    let mut output = TransformOutput::default();
    let mut connections = ConnectionTable::unbounded();
    // Index into `output.attacks` of the event reported for each (type, source)
    let mut reported: HashMap<(AttackType, IpAddr), usize> = HashMap::new();

    stats.total_packets += frames.len() as u64;

    for (index, frame) in frames.into_iter().enumerate() {
        let record = match decode_frame(&frame) {
            Ok(record) => record,
            Err(e) => {
                stats.failed_packets += 1;
                debug!("[TRANSFORM] Skipping packet {}: {}", index, e);
                continue;
            }
        };
        stats.processed_packets += 1;

        if let (Some(source), Some(destination)) = (record.source(), record.destination()) {
            update_statistics(&mut output.ip_statistics, &record, source, destination);
            if connections.record(&record) {
                stats.connections_created += 1;
            }
            detect(&mut output, &mut reported, &record, source, destination, config);
        }

        output.packets.push(StoredPacket { index, record });
    }

    output.connections = connections.records();
    stats.attacks_detected = output.attacks.len() as u64;

    info!(
        "[TRANSFORM] {} processed, {} failed, {} connections, {} attacks",
        stats.processed_packets,
        stats.failed_packets,
        stats.connections_created,
        stats.attacks_detected
    );
    output
}

fn update_statistics(
    table: &mut BTreeMap<IpAddr, IpStatistics>,
    record: &PacketRecord,
    source: IpAddr,
    destination: IpAddr,
) {
    let sender = table
        .entry(source)
        .or_insert_with(|| IpStatistics::new(record.timestamp));
    sender.touch(record);
    sender.bytes_sent += record.size as u64;
    if let Some(port) = record.src_port() {
        sender.ports.insert(port);
    }
    if record.is_syn_request() {
        sender.syn_packets += 1;
    } else if record.protocol() == Protocol::Udp {
        sender.udp_packets += 1;
    }

    let receiver = table
        .entry(destination)
        .or_insert_with(|| IpStatistics::new(record.timestamp));
    receiver.touch(record);
    receiver.bytes_received += record.size as u64;
    if let Some(port) = record.dst_port() {
        receiver.ports.insert(port);
    }
}

fn detect(
    output: &mut TransformOutput,
    reported: &mut HashMap<(AttackType, IpAddr), usize>,
    record: &PacketRecord,
    source: IpAddr,
    destination: IpAddr,
    config: &EtlConfig,
) {
    let stats = match output.ip_statistics.get(&source) {
        Some(stats) => stats,
        None => return,
    };

    let (attack_type, count, severity) = if record.is_syn_request() {
        if stats.syn_packets <= config.syn_threshold {
            return;
        }
        (AttackType::SynFlood, stats.syn_packets, Severity::High)
    } else if record.protocol() == Protocol::Udp {
        if stats.udp_packets <= config.udp_threshold {
            return;
        }
        (AttackType::UdpFlood, stats.udp_packets, Severity::Medium)
    } else {
        return;
    };

    let key = (attack_type.clone(), source);
    if let Some(&idx) = reported.get(&key) {
        output.attacks[idx].packet_count = count;
        return;
    }

    let classification = fallback_classification(&attack_type, source);
    let event = AttackEvent::new(
        attack_type,
        source,
        destination,
        severity,
        count,
        record.timestamp,
        classification,
    )
    .with_details(PacketDetails::from(record));
    reported.insert(key, output.attacks.len());
    output.attacks.push(event);
}
