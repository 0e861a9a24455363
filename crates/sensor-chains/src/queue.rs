//! Output Queues
//!
//! Each chain entry owns one queue and publishes its matches through it.
//! Publishing never blocks: whatever the transport cannot take right away is
//! counted as a discard and dropped.

use crate::QueueError;
use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use sensor_common::AtomicCounter;
use serde::Serialize;
use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::ToSocketAddrs;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Messaging pattern of the socket behind a queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SocketKind {
    Pair,
    Pub,
    Sub,
    Push,
    Pull,
    Req,
    Rep,
    Surveyor,
    Respondent,
    Bus,
}

impl SocketKind {
    /// Receive-only kinds cannot carry matches
    pub fn can_publish(self) -> bool {
        !matches!(self, SocketKind::Sub | SocketKind::Pull)
    }

    /// Kinds that copy every message to every peer
    pub fn is_broadcast(self) -> bool {
        matches!(self, SocketKind::Pub | SocketKind::Bus | SocketKind::Surveyor)
    }
}

impl FromStr for SocketKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PAIR" => Ok(Self::Pair),
            "PUB" => Ok(Self::Pub),
            "SUB" => Ok(Self::Sub),
            "PUSH" => Ok(Self::Push),
            "PULL" => Ok(Self::Pull),
            "REQ" => Ok(Self::Req),
            "REP" => Ok(Self::Rep),
            "SURVEYOR" => Ok(Self::Surveyor),
            "RESPONDENT" => Ok(Self::Respondent),
            "BUS" => Ok(Self::Bus),
            _ => Err(QueueError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pair => "PAIR",
            Self::Pub => "PUB",
            Self::Sub => "SUB",
            Self::Push => "PUSH",
            Self::Pull => "PULL",
            Self::Req => "REQ",
            Self::Rep => "REP",
            Self::Surveyor => "SURVEYOR",
            Self::Respondent => "RESPONDENT",
            Self::Bus => "BUS",
        };
        f.write_str(name)
    }
}

/// What a queue publishes for each match
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueFormat {
    /// JSON match record
    Metadata,
    /// Raw frame bytes
    Packet,
}

impl FromStr for QueueFormat {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "metadata" => Ok(Self::Metadata),
            "packet" => Ok(Self::Packet),
            _ => Err(QueueError::UnknownFormat(s.to_string())),
        }
    }
}

/// Source tag carried in published records
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Pcap,
    Syslog,
    Sflow,
    Netflow,
}

impl FromStr for ContentType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pcap" => Ok(Self::Pcap),
            "syslog" => Ok(Self::Syslog),
            "sflow" => Ok(Self::Sflow),
            "netflow" => Ok(Self::Netflow),
            _ => Err(QueueError::UnknownContent(s.to_string())),
        }
    }
}

/// Transport settings read from a chain entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub url: String,
    pub kind: SocketKind,
    pub format: QueueFormat,
    pub content: ContentType,
}

impl QueueDescriptor {
    /// Read the `nm_queue_*` keys of a chain entry.
    ///
    /// `nm_queue_url` and `nm_queue_type` are required; format defaults to
    /// `metadata` and content to `pcap`.
    pub fn from_entry(entry: &Value) -> Result<Self, QueueError> {
        let url = entry
            .get("nm_queue_url")
            .and_then(Value::as_str)
            .ok_or(QueueError::MissingKey("nm_queue_url"))?;
        let kind: SocketKind = entry
            .get("nm_queue_type")
            .and_then(Value::as_str)
            .ok_or(QueueError::MissingKey("nm_queue_type"))?
            .parse()?;
        let format = match entry.get("nm_queue_format").and_then(Value::as_str) {
            Some(s) => s.parse()?,
            None => QueueFormat::Metadata,
        };
        let content = match entry.get("nm_queue_content").and_then(Value::as_str) {
            Some(s) => s.parse()?,
            None => ContentType::Pcap,
        };

        Ok(Self {
            url: url.to_string(),
            kind,
            format,
            content,
        })
    }
}

/// Queue statistics
#[derive(Debug, Default)]
pub struct QueueStats {
    pub tx_messages: AtomicCounter,
    pub tx_bytes: AtomicCounter,
    pub tx_discards: AtomicCounter,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            tx_messages: self.tx_messages.get(),
            tx_bytes: self.tx_bytes.get(),
            tx_discards: self.tx_discards.get(),
        }
    }

    fn reset(&self) {
        self.tx_messages.take();
        self.tx_bytes.take();
        self.tx_discards.take();
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub tx_messages: u64,
    pub tx_bytes: u64,
    pub tx_discards: u64,
}

/// Non-blocking publisher bound to one transport endpoint
pub struct OutputQueue {
    descriptor: QueueDescriptor,
    transport: Transport,
    stats: QueueStats,
}

enum Transport {
    Inproc(Arc<InprocEndpoint>),
    Udp(Socket),
    #[cfg(unix)]
    Ipc(std::os::unix::net::UnixDatagram),
    Closed,
}

impl OutputQueue {
    /// Open the transport named by the descriptor's url
    pub fn open(descriptor: QueueDescriptor, registry: &InprocRegistry) -> Result<Self, QueueError> {
        if !descriptor.kind.can_publish() {
            return Err(QueueError::ReceiveOnly(descriptor.kind));
        }

        let (scheme, rest) = descriptor
            .url
            .split_once("://")
            .ok_or_else(|| QueueError::InvalidUrl(descriptor.url.clone()))?;

        let transport = match scheme {
            "inproc" if !rest.is_empty() => Transport::Inproc(registry.endpoint(rest)),
            "udp" => Transport::Udp(open_udp(rest)?),
            #[cfg(unix)]
            "ipc" if !rest.is_empty() => {
                let sock = std::os::unix::net::UnixDatagram::unbound()?;
                sock.connect(rest)?;
                sock.set_nonblocking(true)?;
                Transport::Ipc(sock)
            }
            "inproc" | "ipc" => return Err(QueueError::InvalidUrl(descriptor.url.clone())),
            other => return Err(QueueError::UnsupportedScheme(other.to_string())),
        };

        tracing::debug!(url = %descriptor.url, kind = %descriptor.kind, "output queue opened");

        Ok(Self {
            descriptor,
            transport,
            stats: QueueStats::default(),
        })
    }

    /// Build from a chain entry's `nm_queue_*` keys
    pub fn from_entry(entry: &Value, registry: &InprocRegistry) -> Result<Self, QueueError> {
        Self::open(QueueDescriptor::from_entry(entry)?, registry)
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    pub fn url(&self) -> &str {
        &self.descriptor.url
    }

    pub fn kind(&self) -> SocketKind {
        self.descriptor.kind
    }

    pub fn format(&self) -> QueueFormat {
        self.descriptor.format
    }

    pub fn content(&self) -> ContentType {
        self.descriptor.content
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Send one message without blocking; returns whether it was accepted
    pub fn publish(&self, payload: &[u8]) -> bool {
        let sent = match &self.transport {
            Transport::Inproc(endpoint) => endpoint.deliver(self.descriptor.kind, payload),
            Transport::Udp(sock) => send_counted(sock.send(payload)),
            #[cfg(unix)]
            Transport::Ipc(sock) => send_counted(sock.send(payload)),
            Transport::Closed => false,
        };

        if sent {
            self.stats.tx_messages.inc();
            self.stats.tx_bytes.add(payload.len() as u64);
        } else {
            self.stats.tx_discards.inc();
        }
        sent
    }

    /// Release the transport and zero the counters
    pub fn close(&mut self) {
        self.transport = Transport::Closed;
        self.stats.reset();
    }
}

impl fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputQueue")
            .field("descriptor", &self.descriptor)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

fn send_counted(result: io::Result<usize>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(e) => {
            tracing::trace!(error = %e, "queue send failed");
            false
        }
    }
}

fn open_udp(target: &str) -> Result<Socket, QueueError> {
    let addr = target
        .to_socket_addrs()
        .map_err(|_| QueueError::InvalidUrl(format!("udp://{}", target)))?
        .next()
        .ok_or_else(|| QueueError::InvalidUrl(format!("udp://{}", target)))?;

    let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    sock.connect(&SockAddr::from(addr))?;
    Ok(sock)
}

/// Named in-process endpoints shared by queues and their consumers
#[derive(Default)]
pub struct InprocRegistry {
    endpoints: Mutex<HashMap<String, Arc<InprocEndpoint>>>,
}

impl InprocRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create an endpoint
    pub fn endpoint(&self, name: &str) -> Arc<InprocEndpoint> {
        self.endpoints
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Attach a bounded consumer; accepts either `inproc://name` or `name`
    pub fn subscribe(&self, url: &str, capacity: usize) -> Receiver<Bytes> {
        let name = url.strip_prefix("inproc://").unwrap_or(url);
        self.endpoint(name).attach(capacity)
    }
}

impl fmt::Debug for InprocRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.endpoints.lock().keys().cloned().collect();
        f.debug_struct("InprocRegistry").field("endpoints", &names).finish()
    }
}

/// One in-process endpoint and its attached consumers
#[derive(Default)]
pub struct InprocEndpoint {
    peers: RwLock<Vec<Sender<Bytes>>>,
    cursor: AtomicUsize,
}

impl InprocEndpoint {
    fn attach(&self, capacity: usize) -> Receiver<Bytes> {
        let (tx, rx) = bounded(capacity.max(1));
        self.peers.write().push(tx);
        rx
    }

    /// Number of attached consumers
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn deliver(&self, kind: SocketKind, payload: &[u8]) -> bool {
        let peers = self.peers.read();
        if peers.is_empty() {
            return kind.is_broadcast();
        }

        let message = Bytes::copy_from_slice(payload);

        if kind.is_broadcast() {
            let mut delivered = false;
            for peer in peers.iter() {
                delivered |= peer.try_send(message.clone()).is_ok();
            }
            return delivered;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..peers.len() {
            let peer = &peers[(start + i) % peers.len()];
            match peer.try_send(message.clone()) {
                Ok(()) => return true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => continue,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inproc(url: &str, kind: SocketKind, registry: &InprocRegistry) -> OutputQueue {
        OutputQueue::open(
            QueueDescriptor {
                url: url.into(),
                kind,
                format: QueueFormat::Metadata,
                content: ContentType::Pcap,
            },
            registry,
        )
        .unwrap()
    }

    #[test]
    fn test_descriptor_from_entry() {
        let entry = json!({
            "nm_queue_url": "inproc://dns",
            "nm_queue_type": "push",
            "nm_queue_format": "PACKET",
            "nm_queue_content": "syslog",
        });
        let d = QueueDescriptor::from_entry(&entry).unwrap();
        assert_eq!(d.kind, SocketKind::Push);
        assert_eq!(d.format, QueueFormat::Packet);
        assert_eq!(d.content, ContentType::Syslog);

        let missing = json!({ "nm_queue_url": "inproc://x" });
        assert!(matches!(
            QueueDescriptor::from_entry(&missing),
            Err(QueueError::MissingKey("nm_queue_type"))
        ));
        let bad = json!({ "nm_queue_url": "inproc://x", "nm_queue_type": "fanout" });
        assert!(matches!(QueueDescriptor::from_entry(&bad), Err(QueueError::UnknownKind(_))));
    }

    #[test]
    fn test_receive_only_rejected() {
        let registry = InprocRegistry::new();
        for kind in [SocketKind::Sub, SocketKind::Pull] {
            let d = QueueDescriptor {
                url: "inproc://x".into(),
                kind,
                format: QueueFormat::Metadata,
                content: ContentType::Pcap,
            };
            assert!(matches!(OutputQueue::open(d, &registry), Err(QueueError::ReceiveOnly(_))));
        }
    }

    #[test]
    fn test_unsupported_scheme() {
        let registry = InprocRegistry::new();
        let entry = json!({ "nm_queue_url": "tcp://127.0.0.1:5555", "nm_queue_type": "PUSH" });
        assert!(matches!(
            OutputQueue::from_entry(&entry, &registry),
            Err(QueueError::UnsupportedScheme(_))
        ));
        let entry = json!({ "nm_queue_url": "no-scheme", "nm_queue_type": "PUSH" });
        assert!(matches!(OutputQueue::from_entry(&entry, &registry), Err(QueueError::InvalidUrl(_))));
    }

    #[test]
    fn test_push_round_robin_and_discard() {
        let registry = InprocRegistry::new();
        let queue = inproc("inproc://work", SocketKind::Push, &registry);

        // no consumer yet
        assert!(!queue.publish(b"lost"));

        let a = registry.subscribe("inproc://work", 1);
        let b = registry.subscribe("work", 1);
        assert!(queue.publish(b"one"));
        assert!(queue.publish(b"two"));
        // both full
        assert!(!queue.publish(b"three"));

        let mut got = vec![a.try_recv().unwrap(), b.try_recv().unwrap()];
        got.sort();
        assert_eq!(got, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

        let stats = queue.stats();
        assert_eq!(stats.tx_messages, 2);
        assert_eq!(stats.tx_bytes, 6);
        assert_eq!(stats.tx_discards, 2);
    }

    #[test]
    fn test_pub_broadcast() {
        let registry = InprocRegistry::new();
        let queue = inproc("inproc://events", SocketKind::Pub, &registry);

        // pub with nobody listening still counts as sent
        assert!(queue.publish(b"x"));

        let a = registry.subscribe("inproc://events", 4);
        let b = registry.subscribe("inproc://events", 4);
        assert!(queue.publish(b"y"));
        assert_eq!(a.try_recv().unwrap(), Bytes::from_static(b"y"));
        assert_eq!(b.try_recv().unwrap(), Bytes::from_static(b"y"));
        assert_eq!(queue.stats().tx_messages, 2);
    }

    #[test]
    fn test_close_zeroes_counters() {
        let registry = InprocRegistry::new();
        let mut queue = inproc("inproc://c", SocketKind::Pub, &registry);
        queue.publish(b"abc");
        queue.close();

        assert_eq!(queue.stats(), QueueStatsSnapshot::default());
        assert!(!queue.publish(b"abc"));
        assert_eq!(queue.url(), "inproc://c");
    }

    #[test]
    fn test_udp_publish() {
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let registry = InprocRegistry::new();
        let entry = json!({
            "nm_queue_url": format!("udp://127.0.0.1:{}", port),
            "nm_queue_type": "PAIR",
        });
        let queue = OutputQueue::from_entry(&entry, &registry).unwrap();

        assert!(queue.publish(b"hello"));
        let mut buf = [0u8; 16];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
