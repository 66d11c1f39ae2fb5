//! Decoded packet records.
//!
//! A `PacketRecord` is produced once per captured frame by the decoding
//! boundary (`crate::capture::decode`) and is read-only afterwards. The
//! protocol-specific fields live in the closed `NetworkLayer` enum so that
//! detection code matches on variants instead of probing for attributes.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport-level protocol of a packet, as used for connection keys and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Arp,
    Other,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Arp => "ARP",
            Protocol::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// TCP control bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
}

impl TcpFlags {
    /// A bare connection request: SYN set, ACK clear
    pub fn syn_only() -> Self {
        Self {
            syn: true,
            ..Self::default()
        }
    }

    pub fn is_connection_request(&self) -> bool {
        self.syn && !self.ack
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = [
            (self.fin, 'F'),
            (self.syn, 'S'),
            (self.rst, 'R'),
            (self.psh, 'P'),
            (self.ack, 'A'),
            (self.urg, 'U'),
        ];
        for (set, letter) in bits {
            if set {
                write!(f, "{}", letter)?;
            }
        }
        Ok(())
    }
}

/// Ethernet header fields, present when the capture link type carries them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkLayer {
    pub src_mac: String,
    pub dst_mac: String,
    pub ether_type: u16,
}

/// IPv4/IPv6 header fields relevant to detection and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpHeader {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub version: u8,
    /// TTL (IPv4) or hop limit (IPv6)
    pub ttl: u8,
    /// IP protocol / next-header number
    pub protocol: u8,
    pub total_len: u16,
}

impl IpHeader {
    pub fn new(src: IpAddr, dst: IpAddr, protocol: u8) -> Self {
        Self {
            src,
            dst,
            version: if src.is_ipv4() { 4 } else { 6 },
            ttl: 64,
            protocol,
            total_len: 0,
        }
    }
}

/// Protocol-specific content of a packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "UPPERCASE")]
pub enum NetworkLayer {
    Tcp {
        ip: IpHeader,
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        window: u16,
    },
    Udp {
        ip: IpHeader,
        src_port: u16,
        dst_port: u16,
        length: u16,
    },
    Icmp {
        ip: IpHeader,
        icmp_type: u8,
        code: u8,
    },
    Arp {
        op: u16,
        sender_mac: String,
        target_mac: String,
        sender_ip: IpAddr,
        target_ip: IpAddr,
    },
    Other {
        ip: Option<IpHeader>,
    },
}

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
    /// Size of the packet on the wire in bytes
    pub size: u32,
    /// Ethernet fields, if the capture had a link layer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkLayer>,
    #[serde(flatten)]
    pub layer: NetworkLayer,
}

impl PacketRecord {
    pub fn new(timestamp: DateTime<Utc>, size: u32, layer: NetworkLayer) -> Self {
        Self {
            timestamp,
            size,
            link: None,
            layer,
        }
    }

    /// A TCP segment between two addresses with ephemeral/well-known ports
    pub fn tcp(timestamp: DateTime<Utc>, src: IpAddr, dst: IpAddr, flags: TcpFlags) -> Self {
        Self::new(
            timestamp,
            60,
            NetworkLayer::Tcp {
                ip: IpHeader::new(src, dst, 6),
                src_port: 40000,
                dst_port: 80,
                flags,
                seq: 0,
                ack: 0,
                window: 64240,
            },
        )
    }

    /// A UDP datagram between two addresses
    pub fn udp(timestamp: DateTime<Utc>, src: IpAddr, dst: IpAddr) -> Self {
        Self::new(
            timestamp,
            64,
            NetworkLayer::Udp {
                ip: IpHeader::new(src, dst, 17),
                src_port: 40000,
                dst_port: 53,
                length: 30,
            },
        )
    }

    fn ip(&self) -> Option<&IpHeader> {
        match &self.layer {
            NetworkLayer::Tcp { ip, .. }
            | NetworkLayer::Udp { ip, .. }
            | NetworkLayer::Icmp { ip, .. } => Some(ip),
            NetworkLayer::Other { ip } => ip.as_ref(),
            NetworkLayer::Arp { .. } => None,
        }
    }

    pub fn source(&self) -> Option<IpAddr> {
        match &self.layer {
            NetworkLayer::Arp { sender_ip, .. } => Some(*sender_ip),
            _ => self.ip().map(|ip| ip.src),
        }
    }

    pub fn destination(&self) -> Option<IpAddr> {
        match &self.layer {
            NetworkLayer::Arp { target_ip, .. } => Some(*target_ip),
            _ => self.ip().map(|ip| ip.dst),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match &self.layer {
            NetworkLayer::Tcp { .. } => Protocol::Tcp,
            NetworkLayer::Udp { .. } => Protocol::Udp,
            NetworkLayer::Icmp { .. } => Protocol::Icmp,
            NetworkLayer::Arp { .. } => Protocol::Arp,
            NetworkLayer::Other { .. } => Protocol::Other,
        }
    }

    pub fn tcp_flags(&self) -> Option<TcpFlags> {
        match &self.layer {
            NetworkLayer::Tcp { flags, .. } => Some(*flags),
            _ => None,
        }
    }

    /// True for TCP segments with SYN set and ACK clear
    pub fn is_syn_request(&self) -> bool {
        self.tcp_flags()
            .map(|flags| flags.is_connection_request())
            .unwrap_or(false)
    }

    pub fn src_port(&self) -> Option<u16> {
        match &self.layer {
            NetworkLayer::Tcp { src_port, .. } | NetworkLayer::Udp { src_port, .. } => {
                Some(*src_port)
            }
            _ => None,
        }
    }

    pub fn dst_port(&self) -> Option<u16> {
        match &self.layer {
            NetworkLayer::Tcp { dst_port, .. } | NetworkLayer::Udp { dst_port, .. } => {
                Some(*dst_port)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_syn_request_classification() {
        let now = Utc::now();
        let syn = PacketRecord::tcp(now, addr("10.0.0.5"), addr("10.0.0.1"), TcpFlags::syn_only());
        assert!(syn.is_syn_request());

        let syn_ack = PacketRecord::tcp(
            now,
            addr("10.0.0.1"),
            addr("10.0.0.5"),
            TcpFlags {
                syn: true,
                ack: true,
                ..TcpFlags::default()
            },
        );
        assert!(!syn_ack.is_syn_request());

        let udp = PacketRecord::udp(now, addr("10.0.0.5"), addr("10.0.0.1"));
        assert!(!udp.is_syn_request());
        assert_eq!(udp.protocol(), Protocol::Udp);
        assert_eq!(udp.dst_port(), Some(53));
    }

    #[test]
    fn test_arp_endpoints() {
        let record = PacketRecord::new(
            Utc::now(),
            42,
            NetworkLayer::Arp {
                op: 1,
                sender_mac: "aa:bb:cc:dd:ee:ff".to_string(),
                target_mac: "00:00:00:00:00:00".to_string(),
                sender_ip: addr("192.168.1.10"),
                target_ip: addr("192.168.1.1"),
            },
        );
        assert_eq!(record.source(), Some(addr("192.168.1.10")));
        assert_eq!(record.destination(), Some(addr("192.168.1.1")));
        assert_eq!(record.protocol(), Protocol::Arp);
        assert_eq!(record.src_port(), None);
    }

    #[test]
    fn test_serialized_shape() {
        let record = PacketRecord::tcp(
            Utc::now(),
            addr("10.0.0.5"),
            addr("10.0.0.1"),
            TcpFlags::syn_only(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["protocol"], "TCP");
        assert_eq!(json["flags"]["syn"], true);
        assert!(json.get("link").is_none());
        assert_eq!(TcpFlags::syn_only().to_string(), "S");
    }
}
