//! Ethernet frame decoding
//!
//! A zero-copy view over a received frame. Header fields are read in place;
//! nothing is allocated. Both the metadata extractor and the compiled filter
//! programs evaluate against this view.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Ethernet header length
pub const ETH_HDR_LEN: usize = 14;
/// IPv6 fixed header length
pub const IPV6_HDR_LEN: usize = 40;

/// EtherType for IPv4
pub const ETHER_TYPE_IPV4: u16 = 0x0800;
/// EtherType for ARP
pub const ETHER_TYPE_ARP: u16 = 0x0806;
/// EtherType for IPv6
pub const ETHER_TYPE_IPV6: u16 = 0x86DD;
/// 802.1Q tag
pub const ETHER_TYPE_VLAN: u16 = 0x8100;
/// 802.1ad outer tag
pub const ETHER_TYPE_QINQ: u16 = 0x88A8;

/// ICMPv4
pub const IPPROTO_ICMP: u8 = 1;
/// TCP
pub const IPPROTO_TCP: u8 = 6;
/// UDP
pub const IPPROTO_UDP: u8 = 17;
/// ICMPv6
pub const IPPROTO_ICMPV6: u8 = 58;
/// SCTP
pub const IPPROTO_SCTP: u8 = 132;

/// Maximum stacked 802.1Q tags walked
const VLAN_DEPTH_MAX: usize = 2;

/// 48-bit hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Broadcast address
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// Copy from a 6-byte slice
    #[inline(always)]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[..6]);
        Self(mac)
    }

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl std::str::FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mac = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for octet in mac.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("short mac address: {}", s))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid mac octet '{}' in {}", part, s))?;
        }
        if parts.next().is_some() {
            return Err(format!("long mac address: {}", s));
        }
        Ok(Self(mac))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// ARP header (Ethernet/IPv4 only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpHeader {
    /// Operation (1 request, 2 reply)
    pub op: u16,
    /// Sender hardware address
    pub sha: MacAddr,
    /// Sender protocol address
    pub spa: Ipv4Addr,
    /// Target hardware address
    pub tha: MacAddr,
    /// Target protocol address
    pub tpa: Ipv4Addr,
}

/// IPv4 header fields used by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
    /// Payload protocol number
    pub protocol: u8,
    /// Time to live
    pub ttl: u8,
    /// Header length in bytes (IHL × 4)
    pub header_len: usize,
    /// Total length field, header included
    pub total_len: u16,
    /// Fragment offset in 8-byte units
    pub fragment_offset: u16,
}

/// IPv6 fixed header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header {
    /// Source address
    pub src: Ipv6Addr,
    /// Destination address
    pub dst: Ipv6Addr,
    /// Next header (no extension walking)
    pub next_header: u8,
    /// Hop limit
    pub hop_limit: u8,
    /// Payload length field
    pub payload_len: u16,
}

/// Decoded network layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// ARP over Ethernet/IPv4
    Arp(ArpHeader),
    /// IPv4
    Ipv4(Ipv4Header),
    /// IPv6
    Ipv6(Ipv6Header),
    /// Anything else, or a truncated header
    Other,
}

/// Zero-copy view of one frame
#[derive(Debug, Clone)]
pub struct FrameView<'a> {
    data: &'a [u8],
    /// Destination MAC
    pub dst_mac: MacAddr,
    /// Source MAC
    pub src_mac: MacAddr,
    /// Innermost ethertype (after VLAN tags)
    pub ether_type: u16,
    /// Outermost VLAN id, if tagged
    pub vlan_id: Option<u16>,
    /// Network layer
    pub network: Network,
    l3_offset: usize,
    l4_range: Option<(usize, usize)>,
}

#[inline(always)]
fn be16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

impl<'a> FrameView<'a> {
    /// Decode a frame; `None` if it is shorter than an Ethernet header
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < ETH_HDR_LEN {
            return None;
        }

        let dst_mac = MacAddr::from_slice(&data[0..6]);
        let src_mac = MacAddr::from_slice(&data[6..12]);
        let mut ether_type = be16(data, 12);
        let mut offset = ETH_HDR_LEN;
        let mut vlan_id = None;

        let mut depth = 0;
        while (ether_type == ETHER_TYPE_VLAN || ether_type == ETHER_TYPE_QINQ)
            && depth < VLAN_DEPTH_MAX
            && data.len() >= offset + 4
        {
            if vlan_id.is_none() {
                vlan_id = Some(be16(data, offset) & 0x0fff);
            }
            ether_type = be16(data, offset + 2);
            offset += 4;
            depth += 1;
        }

        let l3 = &data[offset..];
        let (network, l4_range) = match ether_type {
            ETHER_TYPE_ARP => (parse_arp(l3).map_or(Network::Other, Network::Arp), None),
            ETHER_TYPE_IPV4 => match parse_ipv4(l3) {
                Some(h) => {
                    let end = if (h.total_len as usize) >= h.header_len {
                        (offset + h.total_len as usize).min(data.len())
                    } else {
                        data.len()
                    };
                    let start = offset + h.header_len;
                    // only the first fragment carries the transport header
                    let l4 = (h.fragment_offset == 0 && start <= end).then_some((start, end));
                    (Network::Ipv4(h), l4)
                }
                None => (Network::Other, None),
            },
            ETHER_TYPE_IPV6 => match parse_ipv6(l3) {
                Some(h) => {
                    let start = offset + IPV6_HDR_LEN;
                    let end = (start + h.payload_len as usize).min(data.len());
                    (Network::Ipv6(h), Some((start, end)))
                }
                None => (Network::Other, None),
            },
            _ => (Network::Other, None),
        };

        Some(Self {
            data,
            dst_mac,
            src_mac,
            ether_type,
            vlan_id,
            network,
            l3_offset: offset,
            l4_range,
        })
    }

    /// Whole frame
    #[inline(always)]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Frame length on the wire
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset of the network header
    pub fn l3_offset(&self) -> usize {
        self.l3_offset
    }

    /// Offset of the transport header, if any
    pub fn l4_offset(&self) -> Option<usize> {
        self.l4_range.map(|(start, _)| start)
    }

    /// Source protocol address (IP or ARP sender)
    pub fn src_ip(&self) -> Option<IpAddr> {
        match self.network {
            Network::Arp(h) => Some(IpAddr::V4(h.spa)),
            Network::Ipv4(h) => Some(IpAddr::V4(h.src)),
            Network::Ipv6(h) => Some(IpAddr::V6(h.src)),
            Network::Other => None,
        }
    }

    /// Destination protocol address (IP or ARP target)
    pub fn dst_ip(&self) -> Option<IpAddr> {
        match self.network {
            Network::Arp(h) => Some(IpAddr::V4(h.tpa)),
            Network::Ipv4(h) => Some(IpAddr::V4(h.dst)),
            Network::Ipv6(h) => Some(IpAddr::V6(h.dst)),
            Network::Other => None,
        }
    }

    /// IP protocol / IPv6 next header
    pub fn ip_protocol(&self) -> Option<u8> {
        match self.network {
            Network::Ipv4(h) => Some(h.protocol),
            Network::Ipv6(h) => Some(h.next_header),
            _ => None,
        }
    }

    /// TTL / hop limit
    pub fn ttl(&self) -> Option<u8> {
        match self.network {
            Network::Ipv4(h) => Some(h.ttl),
            Network::Ipv6(h) => Some(h.hop_limit),
            _ => None,
        }
    }

    /// Transport header and payload
    pub fn l4(&self) -> Option<&'a [u8]> {
        self.l4_range.map(|(start, end)| &self.data[start..end])
    }

    /// Source and destination ports for TCP, UDP and SCTP
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self.ip_protocol()? {
            IPPROTO_TCP | IPPROTO_UDP | IPPROTO_SCTP => {
                let l4 = self.l4()?;
                (l4.len() >= 4).then(|| (be16(l4, 0), be16(l4, 2)))
            }
            _ => None,
        }
    }

    /// TCP flag byte
    pub fn tcp_flags(&self) -> Option<u8> {
        if self.ip_protocol()? != IPPROTO_TCP {
            return None;
        }
        let l4 = self.l4()?;
        (l4.len() >= 14).then(|| l4[13])
    }

    /// ICMP / ICMPv6 type and code
    pub fn icmp(&self) -> Option<(u8, u8)> {
        match (self.network, self.ip_protocol()?) {
            (Network::Ipv4(_), IPPROTO_ICMP) | (Network::Ipv6(_), IPPROTO_ICMPV6) => {
                let l4 = self.l4()?;
                (l4.len() >= 2).then(|| (l4[0], l4[1]))
            }
            _ => None,
        }
    }

    /// UDP payload
    pub fn udp_payload(&self) -> Option<&'a [u8]> {
        if self.ip_protocol()? != IPPROTO_UDP {
            return None;
        }
        let l4 = self.l4()?;
        (l4.len() >= 8).then(|| &l4[8..])
    }
}

fn parse_arp(data: &[u8]) -> Option<ArpHeader> {
    // htype(2) ptype(2) hlen(1) plen(1) op(2) sha(6) spa(4) tha(6) tpa(4)
    if data.len() < 28 || data[4] != 6 || data[5] != 4 {
        return None;
    }
    Some(ArpHeader {
        op: be16(data, 6),
        sha: MacAddr::from_slice(&data[8..14]),
        spa: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
        tha: MacAddr::from_slice(&data[18..24]),
        tpa: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
    })
}

fn parse_ipv4(data: &[u8]) -> Option<Ipv4Header> {
    if data.len() < 20 || data[0] >> 4 != 4 {
        return None;
    }
    let header_len = ((data[0] & 0x0f) as usize) * 4;
    if header_len < 20 || data.len() < header_len {
        return None;
    }
    Some(Ipv4Header {
        src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        protocol: data[9],
        ttl: data[8],
        header_len,
        total_len: be16(data, 2),
        fragment_offset: be16(data, 6) & 0x1fff,
    })
}

fn parse_ipv6(data: &[u8]) -> Option<Ipv6Header> {
    if data.len() < IPV6_HDR_LEN || data[0] >> 4 != 6 {
        return None;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);
    Some(Ipv6Header {
        src: Ipv6Addr::from(src),
        dst: Ipv6Addr::from(dst),
        next_header: data[6],
        hop_limit: data[7],
        payload_len: be16(data, 4),
    })
}

/// Frame builders shared by unit tests across the workspace
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing {
    use super::*;

    /// Ethernet + IPv4 + TCP with an empty payload
    pub fn tcp4(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, flags: u8) -> Vec<u8> {
        let mut frame = eth_header(ETHER_TYPE_IPV4);
        frame.extend_from_slice(&ipv4_header(src, dst, IPPROTO_TCP, 20));
        frame.extend_from_slice(&sport.to_be_bytes());
        frame.extend_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);
        frame
    }

    /// Ethernet + IPv4 + UDP carrying `payload`
    pub fn udp4(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = eth_header(ETHER_TYPE_IPV4);
        let l4_len = 8 + payload.len();
        frame.extend_from_slice(&ipv4_header(src, dst, IPPROTO_UDP, l4_len));
        frame.extend_from_slice(&sport.to_be_bytes());
        frame.extend_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&(l4_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(payload);
        frame
    }

    /// Ethernet + IPv6 + UDP with an empty payload
    pub fn udp6(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16) -> Vec<u8> {
        let mut frame = eth_header(ETHER_TYPE_IPV6);
        frame.extend_from_slice(&[0x60, 0, 0, 0]);
        frame.extend_from_slice(&8u16.to_be_bytes());
        frame.extend_from_slice(&[IPPROTO_UDP, 64]);
        frame.extend_from_slice(&src.octets());
        frame.extend_from_slice(&dst.octets());
        frame.extend_from_slice(&sport.to_be_bytes());
        frame.extend_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&[0, 8, 0, 0]);
        frame
    }

    /// Ethernet + IPv4 + ICMP echo request with an 8-byte payload
    pub fn icmp4_echo(src: [u8; 4], dst: [u8; 4], id: u16, seq: u16) -> Vec<u8> {
        let mut frame = eth_header(ETHER_TYPE_IPV4);
        frame.extend_from_slice(&ipv4_header(src, dst, IPPROTO_ICMP, 16));
        frame.extend_from_slice(&[8, 0, 0, 0]);
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(b"pingdata");
        frame
    }

    /// Ethernet ARP request asking who has `tpa`
    pub fn arp_request(sha: MacAddr, spa: [u8; 4], tpa: [u8; 4]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(42);
        frame.extend_from_slice(&MacAddr::BROADCAST.0);
        frame.extend_from_slice(&sha.0);
        frame.extend_from_slice(&ETHER_TYPE_ARP.to_be_bytes());
        frame.extend_from_slice(&[0, 1, 0x08, 0x00, 6, 4, 0, 1]);
        frame.extend_from_slice(&sha.0);
        frame.extend_from_slice(&spa);
        frame.extend_from_slice(&[0; 6]);
        frame.extend_from_slice(&tpa);
        frame
    }

    fn eth_header(ether_type: u16) -> Vec<u8> {
        let mut frame = Vec::with_capacity(64);
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame
    }

    fn ipv4_header(src: [u8; 4], dst: [u8; 4], protocol: u8, l4_len: usize) -> [u8; 20] {
        let total = (20 + l4_len) as u16;
        let mut h = [0u8; 20];
        h[0] = 0x45;
        h[2..4].copy_from_slice(&total.to_be_bytes());
        h[8] = 64;
        h[9] = protocol;
        h[12..16].copy_from_slice(&src);
        h[16..20].copy_from_slice(&dst);
        h
    }
}
