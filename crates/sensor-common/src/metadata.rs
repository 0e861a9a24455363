//! Packet Metadata
//!
//! The normalized header record built once per packet. Every chain reads the
//! same record during a classification pass, and metadata-format queues
//! publish it as JSON.

use crate::dns::DnsSummary;
use crate::frame::{FrameView, MacAddr, IPPROTO_UDP};
use crate::PortId;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;

const DNS_PORT: u16 = 53;

/// Which way the packet crossed the port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the wire
    Rx,
    /// Sent by the sensor
    Tx,
}

/// Fixed header record for one packet
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Metadata {
    /// Port the packet was seen on
    pub port_id: PortId,
    /// Receive or transmit
    pub direction: Direction,
    /// Addressed to one of the sensor's own addresses
    #[serde(rename = "self")]
    pub is_self: bool,
    /// Frame length in bytes
    pub length: u32,
    /// Source MAC
    pub smac: MacAddr,
    /// Destination MAC
    pub dmac: MacAddr,
    /// EtherType after any VLAN tags
    pub eth_type: u16,
    /// Outer 802.1Q VLAN id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    /// Source address (IP, or ARP sender)
    pub sip: Option<IpAddr>,
    /// Destination address (IP, or ARP target)
    pub dip: Option<IpAddr>,
    /// IP protocol / IPv6 next header, 0 when not IP
    pub ip_protocol: u8,
    /// TTL or hop limit
    pub ttl: u8,
    /// Transport header plus payload length
    pub l4_length: u16,
    /// ICMP / ICMPv6 type
    pub icmp_type: u8,
    /// ICMP / ICMPv6 code
    pub icmp_code: u8,
    /// TCP flag byte
    pub tcp_flags: u8,
    /// TCP/UDP source port
    pub sport: u16,
    /// TCP/UDP destination port
    pub dport: u16,
    /// DNS query name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    /// DNS answer values (at most 8)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_answers: Vec<String>,
}

impl Metadata {
    /// DNS query name, empty when the packet is not DNS
    pub fn dns_name(&self) -> &str {
        self.dns_name.as_deref().unwrap_or("")
    }

    /// Source then destination address, skipping absent ones
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.sip.into_iter().chain(self.dip)
    }
}

/// Builds a [`Metadata`] record from a decoded frame
pub trait MetadataExtractor: Send + Sync {
    /// Normalize one frame
    fn extract(&self, port_id: PortId, direction: Direction, frame: &FrameView<'_>) -> Metadata;
}

/// Header-only extractor with DNS name decoding on port 53
#[derive(Debug, Default, Clone)]
pub struct HeaderExtractor {
    local_addrs: HashSet<IpAddr>,
}

impl HeaderExtractor {
    /// Create an extractor that flags traffic to `local_addrs` as self
    pub fn new(local_addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            local_addrs: local_addrs.into_iter().collect(),
        }
    }

    /// Check if an address belongs to the sensor
    pub fn is_local(&self, addr: &IpAddr) -> bool {
        self.local_addrs.contains(addr)
    }
}

impl MetadataExtractor for HeaderExtractor {
    fn extract(&self, port_id: PortId, direction: Direction, frame: &FrameView<'_>) -> Metadata {
        let sip = frame.src_ip();
        let dip = frame.dst_ip();
        let (sport, dport) = frame.ports().unwrap_or((0, 0));
        let (icmp_type, icmp_code) = frame.icmp().unwrap_or((0, 0));

        let mut metadata = Metadata {
            port_id,
            direction,
            is_self: dip.map_or(false, |ip| self.is_local(&ip)),
            length: frame.len() as u32,
            smac: frame.src_mac,
            dmac: frame.dst_mac,
            eth_type: frame.ether_type,
            vlan_id: frame.vlan_id,
            sip,
            dip,
            ip_protocol: frame.ip_protocol().unwrap_or(0),
            ttl: frame.ttl().unwrap_or(0),
            l4_length: frame.l4().map_or(0, |l4| l4.len() as u16),
            icmp_type,
            icmp_code,
            tcp_flags: frame.tcp_flags().unwrap_or(0),
            sport,
            dport,
            dns_name: None,
            dns_answers: Vec::new(),
        };

        if metadata.ip_protocol == IPPROTO_UDP && (sport == DNS_PORT || dport == DNS_PORT) {
            if let Some(summary) = frame.udp_payload().and_then(DnsSummary::parse) {
                metadata.dns_name = Some(summary.qname);
                metadata.dns_answers = summary.answers;
            }
        }

        metadata
    }
}
