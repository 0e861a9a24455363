//! Protocol handlers
//!
//! Handlers see every received frame before the chains do and may queue
//! replies for transmission on the ingress port. Each worker owns its own
//! set, so handlers keep plain mutable state.

use crate::io::Packet;
use bytes::{BufMut, BytesMut};
use sensor_common::frame::{ETHER_TYPE_ARP, IPPROTO_ICMP};
use sensor_common::{FrameView, MacAddr, Metadata, Network, PortId};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const REPLY_TTL: u8 = 64;
const ETH_MIN_FRAME: usize = 60;
const ICMP_ECHO_HEADER_LEN: usize = 8;

/// Learned neighbours are forgotten after this long
pub const NEIGHBOUR_TTL: Duration = Duration::from_secs(300);

/// Addresses one port answers for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortIdentity {
    pub mac: MacAddr,
    pub ipv4: Vec<Ipv4Addr>,
}

impl PortIdentity {
    pub fn new(mac: MacAddr, addrs: &[IpAddr]) -> Self {
        let ipv4 = addrs
            .iter()
            .filter_map(|a| match a {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        Self { mac, ipv4 }
    }

    pub fn owns(&self, addr: Ipv4Addr) -> bool {
        self.ipv4.contains(&addr)
    }
}

/// Per-frame hook run ahead of classification
pub trait ProtocolHandler: Send {
    fn name(&self) -> &'static str;

    /// Inspect one frame; replies go to `replies`
    fn handle(&mut self, port: PortId, frame: &FrameView<'_>, metadata: &Metadata, replies: &mut Vec<Packet>);

    /// Periodic housekeeping from the drain phase
    fn on_timer(&mut self, _now: Instant) {}
}

/// Answers ARP requests for the port's addresses and remembers who asked
pub struct ArpResponder {
    ports: Vec<PortIdentity>,
    neighbours: HashMap<Ipv4Addr, (MacAddr, Instant)>,
    replies: u64,
}

impl ArpResponder {
    pub fn new(ports: Vec<PortIdentity>) -> Self {
        Self {
            ports,
            neighbours: HashMap::new(),
            replies: 0,
        }
    }

    /// Hardware address last seen for `addr`
    pub fn neighbour(&self, addr: Ipv4Addr) -> Option<MacAddr> {
        self.neighbours.get(&addr).map(|(mac, _)| *mac)
    }

    pub fn replies(&self) -> u64 {
        self.replies
    }
}

impl ProtocolHandler for ArpResponder {
    fn name(&self) -> &'static str {
        "arp"
    }

    fn handle(&mut self, port: PortId, frame: &FrameView<'_>, _metadata: &Metadata, replies: &mut Vec<Packet>) {
        let Network::Arp(arp) = frame.network else {
            return;
        };
        if !arp.spa.is_unspecified() {
            self.neighbours.insert(arp.spa, (arp.sha, Instant::now()));
        }
        if arp.op != ARP_OP_REQUEST {
            return;
        }
        let Some(identity) = self.ports.get(port as usize) else {
            return;
        };
        if !identity.owns(arp.tpa) {
            return;
        }

        let mut out = BytesMut::with_capacity(ETH_MIN_FRAME);
        out.put_slice(&arp.sha.octets());
        out.put_slice(&identity.mac.octets());
        out.put_u16(ETHER_TYPE_ARP);
        out.put_u16(1); // ethernet
        out.put_u16(0x0800);
        out.put_u8(6);
        out.put_u8(4);
        out.put_u16(ARP_OP_REPLY);
        out.put_slice(&identity.mac.octets());
        out.put_slice(&arp.tpa.octets());
        out.put_slice(&arp.sha.octets());
        out.put_slice(&arp.spa.octets());
        out.resize(ETH_MIN_FRAME, 0);

        tracing::trace!(port, target = %arp.tpa, asker = %arp.spa, "arp reply");
        self.replies += 1;
        replies.push(Packet {
            data: out.freeze(),
            port,
        });
    }

    fn on_timer(&mut self, now: Instant) {
        self.neighbours
            .retain(|_, (_, seen)| now.saturating_duration_since(*seen) < NEIGHBOUR_TTL);
    }
}

/// Answers ICMPv4 echo requests addressed to the port
pub struct EchoResponder {
    ports: Vec<PortIdentity>,
}

impl EchoResponder {
    pub fn new(ports: Vec<PortIdentity>) -> Self {
        Self { ports }
    }
}

impl ProtocolHandler for EchoResponder {
    fn name(&self) -> &'static str {
        "icmp_echo"
    }

    fn handle(&mut self, port: PortId, frame: &FrameView<'_>, _metadata: &Metadata, replies: &mut Vec<Packet>) {
        let Network::Ipv4(ip) = frame.network else {
            return;
        };
        if ip.protocol != IPPROTO_ICMP || frame.icmp() != Some((ICMP_ECHO_REQUEST, 0)) {
            return;
        }
        let Some(identity) = self.ports.get(port as usize) else {
            return;
        };
        if !identity.owns(ip.dst) {
            return;
        }
        let (Some(l4_offset), Some(l4)) = (frame.l4_offset(), frame.l4()) else {
            return;
        };
        // type, code, checksum, id, seq
        if l4.len() < ICMP_ECHO_HEADER_LEN {
            return;
        }

        let l3 = frame.l3_offset();
        let end = l4_offset + l4.len();
        let mut out = BytesMut::from(&frame.data()[..end]);

        out[0..6].copy_from_slice(&frame.src_mac.octets());
        out[6..12].copy_from_slice(&identity.mac.octets());

        // IPv4: swap addresses, fresh TTL, recompute header checksum
        out[l3 + 8] = REPLY_TTL;
        out[l3 + 12..l3 + 16].copy_from_slice(&ip.dst.octets());
        out[l3 + 16..l3 + 20].copy_from_slice(&ip.src.octets());
        out[l3 + 10..l3 + 12].copy_from_slice(&[0, 0]);
        let sum = checksum(&out[l3..l3 + ip.header_len]);
        out[l3 + 10..l3 + 12].copy_from_slice(&sum.to_be_bytes());

        // ICMP: type 0, same id/seq/payload
        out[l4_offset] = ICMP_ECHO_REPLY;
        out[l4_offset + 2..l4_offset + 4].copy_from_slice(&[0, 0]);
        let sum = checksum(&out[l4_offset..end]);
        out[l4_offset + 2..l4_offset + 4].copy_from_slice(&sum.to_be_bytes());

        if out.len() < ETH_MIN_FRAME {
            out.resize(ETH_MIN_FRAME, 0);
        }
        tracing::trace!(port, peer = %ip.src, "echo reply");
        replies.push(Packet {
            data: out.freeze(),
            port,
        });
    }
}

/// RFC 1071 ones' complement sum
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_be_bytes([c[0], c[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// The handlers every worker runs
pub fn default_handlers(ports: &[PortIdentity]) -> Vec<Box<dyn ProtocolHandler>> {
    vec![
        Box::new(ArpResponder::new(ports.to_vec())),
        Box::new(EchoResponder::new(ports.to_vec())),
    ]
}
