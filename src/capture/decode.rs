//! Frame decoding.
//!
//! Turns a raw captured frame into a typed [`PacketRecord`]. Everything
//! protocol-specific is resolved here, once; downstream code only matches on
//! [`NetworkLayer`] variants.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap_file::DataLink;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::packet::{IpHeader, LinkLayer, NetworkLayer, PacketRecord, TcpFlags};

const ETHERNET_HEADER_LEN: usize = 14;
const ETHER_TYPE_ARP: u16 = 0x0806;
const ARP_IPV4_BODY_LEN: usize = 28;

/// Errors that can occur while decoding a frame
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame truncated: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Link layer framing of captured data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Ethernet II frames
    Ethernet,
    /// Bare IPv4/IPv6 packets
    RawIp,
}

impl LinkType {
    /// Map a capture-file link type, if it is one we can decode
    pub fn from_datalink(datalink: DataLink) -> Option<Self> {
        match datalink {
            DataLink::ETHERNET => Some(LinkType::Ethernet),
            DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => Some(LinkType::RawIp),
            _ => None,
        }
    }

    pub fn to_datalink(self) -> DataLink {
        match self {
            LinkType::Ethernet => DataLink::ETHERNET,
            LinkType::RawIp => DataLink::RAW,
        }
    }
}

/// A captured frame as delivered by a capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub timestamp: DateTime<Utc>,
    pub link_type: LinkType,
    /// Captured bytes (possibly shorter than the packet on the wire)
    pub data: Vec<u8>,
    /// Length of the packet on the wire
    pub original_len: u32,
}

impl RawFrame {
    pub fn new(timestamp: DateTime<Utc>, link_type: LinkType, data: Vec<u8>) -> Self {
        let original_len = data.len() as u32;
        Self {
            timestamp,
            link_type,
            data,
            original_len,
        }
    }
}

/// Decode one frame into a packet record
pub fn decode_frame(frame: &RawFrame) -> Result<PacketRecord, DecodeError> {
    let (link, layer) = match frame.link_type {
        LinkType::Ethernet => decode_ethernet(&frame.data)?,
        LinkType::RawIp => {
            let sliced = SlicedPacket::from_ip(&frame.data)
                .map_err(|e| DecodeError::Malformed(e.to_string()))?;
            (None, network_layer(&sliced))
        }
    };

    Ok(PacketRecord {
        timestamp: frame.timestamp,
        size: frame.original_len,
        link,
        layer,
    })
}

fn decode_ethernet(data: &[u8]) -> Result<(Option<LinkLayer>, NetworkLayer), DecodeError> {
    if data.len() < ETHERNET_HEADER_LEN {
        return Err(DecodeError::Truncated {
            len: data.len(),
            needed: ETHERNET_HEADER_LEN,
        });
    }

    let ether_type = u16::from_be_bytes([data[12], data[13]]);
    let link = LinkLayer {
        dst_mac: format_mac(&data[0..6]),
        src_mac: format_mac(&data[6..12]),
        ether_type,
    };

    // ARP is read straight from the frame body.
    if ether_type == ETHER_TYPE_ARP {
        let layer = decode_arp(&data[ETHERNET_HEADER_LEN..])?;
        return Ok((Some(link), layer));
    }

    let sliced =
        SlicedPacket::from_ethernet(data).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    Ok((Some(link), network_layer(&sliced)))
}

/// IPv4-over-Ethernet ARP body
fn decode_arp(body: &[u8]) -> Result<NetworkLayer, DecodeError> {
    if body.len() < ARP_IPV4_BODY_LEN {
        return Err(DecodeError::Truncated {
            len: body.len(),
            needed: ARP_IPV4_BODY_LEN,
        });
    }
    let hardware_len = body[4];
    let protocol_len = body[5];
    if hardware_len != 6 || protocol_len != 4 {
        return Err(DecodeError::Malformed(format!(
            "unsupported ARP address lengths {}/{}",
            hardware_len, protocol_len
        )));
    }

    Ok(NetworkLayer::Arp {
        op: u16::from_be_bytes([body[6], body[7]]),
        sender_mac: format_mac(&body[8..14]),
        sender_ip: IpAddr::V4(Ipv4Addr::new(body[14], body[15], body[16], body[17])),
        target_mac: format_mac(&body[18..24]),
        target_ip: IpAddr::V4(Ipv4Addr::new(body[24], body[25], body[26], body[27])),
    })
}

fn network_layer(sliced: &SlicedPacket<'_>) -> NetworkLayer {
    let ip = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            IpHeader {
                src: IpAddr::V4(header.source_addr()),
                dst: IpAddr::V4(header.destination_addr()),
                version: 4,
                ttl: header.ttl(),
                protocol: header.protocol().0,
                total_len: header.total_len(),
            }
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            IpHeader {
                src: IpAddr::V6(header.source_addr()),
                dst: IpAddr::V6(header.destination_addr()),
                version: 6,
                ttl: header.hop_limit(),
                protocol: header.next_header().0,
                total_len: header.payload_length().saturating_add(40),
            }
        }
        _ => return NetworkLayer::Other { ip: None },
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => NetworkLayer::Tcp {
            ip,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            flags: TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                urg: tcp.urg(),
            },
            seq: tcp.sequence_number(),
            ack: tcp.acknowledgment_number(),
            window: tcp.window_size(),
        },
        Some(TransportSlice::Udp(udp)) => NetworkLayer::Udp {
            ip,
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
            length: udp.length(),
        },
        Some(TransportSlice::Icmpv4(icmp)) => NetworkLayer::Icmp {
            ip,
            icmp_type: icmp.type_u8(),
            code: icmp.code_u8(),
        },
        Some(TransportSlice::Icmpv6(icmp)) => NetworkLayer::Icmp {
            ip,
            icmp_type: icmp.type_u8(),
            code: icmp.code_u8(),
        },
        _ => NetworkLayer::Other { ip: Some(ip) },
    }
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Synthetic frames for tests across the crate.

    use super::*;
    use etherparse::PacketBuilder;

    const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x05];
    const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

    pub fn syn_frame(src: [u8; 4], dst: [u8; 4], timestamp: DateTime<Utc>) -> RawFrame {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4(src, dst, 64)
            .tcp(40000, 80, 1000, 64240)
            .syn();
        let mut data = Vec::with_capacity(builder.size(0));
        builder.write(&mut data, &[]).unwrap();
        RawFrame::new(timestamp, LinkType::Ethernet, data)
    }

    pub fn udp_frame(src: [u8; 4], dst: [u8; 4], timestamp: DateTime<Utc>) -> RawFrame {
        let payload = [0u8; 16];
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4(src, dst, 64)
            .udp(40000, 53);
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut data, &payload).unwrap();
        RawFrame::new(timestamp, LinkType::Ethernet, data)
    }

    pub fn arp_request(sender: [u8; 4], target: [u8; 4], timestamp: DateTime<Utc>) -> RawFrame {
        let mut data = Vec::with_capacity(42);
        data.extend_from_slice(&[0xff; 6]);
        data.extend_from_slice(&SRC_MAC);
        data.extend_from_slice(&ETHER_TYPE_ARP.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
        data.extend_from_slice(&SRC_MAC);
        data.extend_from_slice(&sender);
        data.extend_from_slice(&[0; 6]);
        data.extend_from_slice(&target);
        RawFrame::new(timestamp, LinkType::Ethernet, data)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::core::packet::Protocol;
    use etherparse::PacketBuilder;

    #[test]
    fn test_decode_syn() {
        let now = Utc::now();
        let record = decode_frame(&syn_frame([10, 0, 0, 5], [10, 0, 0, 1], now)).unwrap();

        assert_eq!(record.timestamp, now);
        assert_eq!(record.protocol(), Protocol::Tcp);
        assert!(record.is_syn_request());
        assert_eq!(record.source(), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(record.dst_port(), Some(80));

        let link = record.link.unwrap();
        assert_eq!(link.src_mac, "02:00:00:00:00:05");
        assert_eq!(link.ether_type, 0x0800);
    }

    #[test]
    fn test_decode_udp() {
        let record = decode_frame(&udp_frame([10, 0, 0, 7], [10, 0, 0, 1], Utc::now())).unwrap();
        match record.layer {
            NetworkLayer::Udp {
                ip,
                dst_port,
                length,
                ..
            } => {
                assert_eq!(ip.version, 4);
                assert_eq!(dst_port, 53);
                assert_eq!(length, 8 + 16);
            }
            other => panic!("expected UDP, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_arp() {
        let record =
            decode_frame(&arp_request([192, 168, 1, 10], [192, 168, 1, 1], Utc::now())).unwrap();
        assert_eq!(record.protocol(), Protocol::Arp);
        assert_eq!(record.source(), Some("192.168.1.10".parse().unwrap()));
        assert_eq!(record.destination(), Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_decode_raw_ipv6_icmp() {
        let src = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let dst = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        let builder = PacketBuilder::ipv6(src, dst, 32).icmpv6_echo_request(1, 1);
        let mut data = Vec::new();
        builder.write(&mut data, &[]).unwrap();

        let record = decode_frame(&RawFrame::new(Utc::now(), LinkType::RawIp, data)).unwrap();
        assert!(record.link.is_none());
        match record.layer {
            NetworkLayer::Icmp { ip, icmp_type, .. } => {
                assert_eq!(ip.version, 6);
                assert_eq!(ip.ttl, 32);
                assert_eq!(icmp_type, 128);
            }
            other => panic!("expected ICMP, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frames() {
        let short = RawFrame::new(Utc::now(), LinkType::Ethernet, vec![0u8; 10]);
        assert_eq!(
            decode_frame(&short),
            Err(DecodeError::Truncated { len: 10, needed: 14 })
        );

        let mut arp = arp_request([10, 0, 0, 1], [10, 0, 0, 2], Utc::now());
        arp.data.truncate(30);
        assert!(matches!(decode_frame(&arp), Err(DecodeError::Truncated { .. })));
    }
}
