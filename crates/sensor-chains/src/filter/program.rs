//! Filter program tree and its evaluation over a decoded frame

use ipnetwork::IpNetwork;
use sensor_common::frame::{
    IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP,
};
use sensor_common::{FrameView, MacAddr, Network};
use std::net::IpAddr;

/// Which endpoint a primitive tests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
    Src,
    Dst,
    /// `src or dst` (the default)
    Either,
    /// `src and dst`
    Both,
}

impl Dir {
    fn test<T>(self, src: Option<T>, dst: Option<T>, pred: impl Fn(T) -> bool) -> bool {
        match self {
            Dir::Src => src.map_or(false, &pred),
            Dir::Dst => dst.map_or(false, &pred),
            Dir::Either => src.map_or(false, &pred) || dst.map_or(false, &pred),
            Dir::Both => src.map_or(false, &pred) && dst.map_or(false, &pred),
        }
    }
}

/// Protocol keywords usable alone or as qualifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Ether,
    Ip,
    Ip6,
    Arp,
    Tcp,
    Udp,
    Sctp,
    Icmp,
    Icmp6,
}

impl Proto {
    fn matches(self, frame: &FrameView<'_>) -> bool {
        match self {
            Proto::Ether => true,
            Proto::Ip => matches!(frame.network, Network::Ipv4(_)),
            Proto::Ip6 => matches!(frame.network, Network::Ipv6(_)),
            Proto::Arp => matches!(frame.network, Network::Arp(_)),
            Proto::Tcp => frame.ip_protocol() == Some(IPPROTO_TCP),
            Proto::Udp => frame.ip_protocol() == Some(IPPROTO_UDP),
            Proto::Sctp => frame.ip_protocol() == Some(IPPROTO_SCTP),
            Proto::Icmp => {
                matches!(frame.network, Network::Ipv4(_)) && frame.ip_protocol() == Some(IPPROTO_ICMP)
            }
            Proto::Icmp6 => {
                matches!(frame.network, Network::Ipv6(_))
                    && frame.ip_protocol() == Some(IPPROTO_ICMPV6)
            }
        }
    }
}

/// Leaf test
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Primitive {
    Proto(Proto),
    Host(Dir, IpAddr),
    Net(Dir, IpNetwork),
    PortRange(Dir, u16, u16),
    EtherHost(Dir, MacAddr),
    IpProto(u8),
    Vlan(Option<u16>),
    Less(usize),
    Greater(usize),
}

impl Primitive {
    fn matches(&self, frame: &FrameView<'_>) -> bool {
        match self {
            Primitive::Proto(p) => p.matches(frame),
            Primitive::Host(dir, addr) => dir.test(frame.src_ip(), frame.dst_ip(), |ip| ip == *addr),
            Primitive::Net(dir, net) => dir.test(frame.src_ip(), frame.dst_ip(), |ip| net.contains(ip)),
            Primitive::PortRange(dir, lo, hi) => match frame.ports() {
                Some((sport, dport)) => {
                    dir.test(Some(sport), Some(dport), |p| *lo <= p && p <= *hi)
                }
                None => false,
            },
            Primitive::EtherHost(dir, mac) => {
                dir.test(Some(frame.src_mac), Some(frame.dst_mac), |m| m == *mac)
            }
            Primitive::IpProto(proto) => frame.ip_protocol() == Some(*proto),
            Primitive::Vlan(id) => match (frame.vlan_id, id) {
                (Some(_), None) => true,
                (Some(tag), Some(want)) => tag == *want,
                (None, _) => false,
            },
            Primitive::Less(n) => frame.len() <= *n,
            Primitive::Greater(n) => frame.len() >= *n,
        }
    }
}

/// Boolean expression over primitives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    /// Empty expression, accepts everything
    All,
    Prim(Primitive),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub(crate) fn and(lhs: Expr, rhs: Expr) -> Expr {
        Expr::And(Box::new(lhs), Box::new(rhs))
    }

    pub(crate) fn or(lhs: Expr, rhs: Expr) -> Expr {
        Expr::Or(Box::new(lhs), Box::new(rhs))
    }

    /// Evaluate against a frame
    pub fn eval(&self, frame: &FrameView<'_>) -> bool {
        match self {
            Expr::All => true,
            Expr::Prim(p) => p.matches(frame),
            Expr::Not(e) => !e.eval(frame),
            Expr::And(a, b) => a.eval(frame) && b.eval(frame),
            Expr::Or(a, b) => a.eval(frame) || b.eval(frame),
        }
    }
}
