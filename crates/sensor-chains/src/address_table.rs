//! Address Table
//!
//! Host entries (/32, /128) live in exact-match maps; shorter prefixes live in
//! one binary trie per family. A lookup tries the exact map first and only
//! falls back to longest-prefix matching on a miss.
//!
//! Prefixes are stored with their host bits cleared, and a second entry with
//! the same (prefix, length) is rejected, so two candidates of equal length
//! can never cover the same address.

use crate::queue::{InprocRegistry, OutputQueue};
use crate::{entry_name, entry_str, ChainError, EntryCore, EntryId, Result};
use ipnetwork::IpNetwork;
use sensor_common::{AtomicCounter, Metadata};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;

/// How an address was resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    Exact,
    Prefix,
}

/// One prefix and its queue
#[derive(Debug)]
pub struct AddressEntry {
    core: EntryCore,
    network: IpNetwork,
}

impl AddressEntry {
    pub fn core(&self) -> &EntryCore {
        &self.core
    }

    /// Canonical prefix
    pub fn network(&self) -> IpNetwork {
        self.network
    }
}

/// Lookup counters by family and strategy
#[derive(Debug, Default)]
struct TableCounters {
    hash4: AtomicCounter,
    hash6: AtomicCounter,
    cidr4: AtomicCounter,
    cidr6: AtomicCounter,
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddressTableStats {
    pub hash4: u64,
    pub hash6: u64,
    pub cidr4: u64,
    pub cidr6: u64,
}

/// Exact maps plus longest-prefix tries for IPv4 and IPv6
#[derive(Debug, Default)]
pub struct AddressTable {
    // slot index == entry id; removed entries leave a hole
    slots: Vec<Option<AddressEntry>>,
    exact4: HashMap<[u8; 4], EntryId>,
    exact6: HashMap<[u8; 16], EntryId>,
    trie4: PrefixTrie,
    trie6: PrefixTrie,
    counters: TableCounters,
    matches: AtomicCounter,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `cidr_table` entries, skipping the ones that fail
    pub fn from_config(entries: &[Value], registry: &InprocRegistry) -> Self {
        let mut table = Self::new();
        for (index, entry) in entries.iter().enumerate() {
            let result = entry_str(entry, "cidr").and_then(|cidr| {
                let name = entry_name(entry, || cidr.to_string());
                let network = parse_cidr(cidr)?;
                // reject duplicates before a transport gets opened for them
                if table.find(network).is_some() {
                    return Err(ChainError::DuplicatePrefix(network.to_string()));
                }
                let queue = OutputQueue::from_entry(entry, registry)?;
                table.insert(name, network, queue)
            });
            if let Err(e) = result {
                tracing::warn!(chain = "cidr", index, error = %e, "skipping table entry");
            }
        }
        table
    }

    /// Add a prefix; a bare address is a host entry
    pub fn add(&mut self, name: &str, cidr: &str, queue: OutputQueue) -> Result<EntryId> {
        let network = parse_cidr(cidr)?;
        self.insert(name.to_string(), network, queue)
    }

    fn insert(&mut self, name: String, network: IpNetwork, queue: OutputQueue) -> Result<EntryId> {
        if self.find(network).is_some() {
            return Err(ChainError::DuplicatePrefix(network.to_string()));
        }

        let id = self.slots.len() as EntryId;
        match network {
            IpNetwork::V4(n) if n.prefix() == 32 => {
                self.exact4.insert(n.ip().octets(), id);
            }
            IpNetwork::V6(n) if n.prefix() == 128 => {
                self.exact6.insert(n.ip().octets(), id);
            }
            IpNetwork::V4(n) => self.trie4.insert(key4(n.network().octets()), n.prefix(), id),
            IpNetwork::V6(n) => self.trie6.insert(key6(n.network().octets()), n.prefix(), id),
        }

        tracing::info!(chain = "cidr", id, name = %name, cidr = %network, "entry added");
        self.slots.push(Some(AddressEntry {
            core: EntryCore::new(id, name, queue),
            network,
        }));
        Ok(id)
    }

    /// Remove by CIDR text
    pub fn remove(&mut self, cidr: &str) -> Result<Option<AddressEntry>> {
        let network = parse_cidr(cidr)?;
        let Some(id) = self.find(network) else {
            return Ok(None);
        };

        match network {
            IpNetwork::V4(n) if n.prefix() == 32 => {
                self.exact4.remove(&n.ip().octets());
            }
            IpNetwork::V6(n) if n.prefix() == 128 => {
                self.exact6.remove(&n.ip().octets());
            }
            IpNetwork::V4(n) => {
                self.trie4.remove(key4(n.network().octets()), n.prefix());
            }
            IpNetwork::V6(n) => {
                self.trie6.remove(key6(n.network().octets()), n.prefix());
            }
        }
        Ok(self.slots.get_mut(id as usize).and_then(Option::take))
    }

    /// Entry stored under exactly this canonical prefix
    fn find(&self, network: IpNetwork) -> Option<EntryId> {
        match network {
            IpNetwork::V4(n) if n.prefix() == 32 => self.exact4.get(&n.ip().octets()).copied(),
            IpNetwork::V6(n) if n.prefix() == 128 => self.exact6.get(&n.ip().octets()).copied(),
            IpNetwork::V4(n) => self.trie4.get(key4(n.network().octets()), n.prefix()),
            IpNetwork::V6(n) => self.trie6.get(key6(n.network().octets()), n.prefix()),
        }
    }

    fn entry(&self, id: EntryId) -> Option<&AddressEntry> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    /// Resolve one address: exact map first, then longest prefix
    pub fn lookup(&self, addr: IpAddr) -> Option<(&AddressEntry, LookupKind)> {
        let (hit, kind) = match addr {
            IpAddr::V4(a) => match self.exact4.get(&a.octets()) {
                Some(&id) => {
                    self.counters.hash4.inc();
                    (id, LookupKind::Exact)
                }
                None => {
                    let id = self.trie4.longest_match(key4(a.octets()))?;
                    self.counters.cidr4.inc();
                    (id, LookupKind::Prefix)
                }
            },
            IpAddr::V6(a) => match self.exact6.get(&a.octets()) {
                Some(&id) => {
                    self.counters.hash6.inc();
                    (id, LookupKind::Exact)
                }
                None => {
                    let id = self.trie6.longest_match(key6(a.octets()))?;
                    self.counters.cidr6.inc();
                    (id, LookupKind::Prefix)
                }
            },
        };
        self.entry(hit).map(|e| (e, kind))
    }

    /// Look up source then destination; an entry hit by both runs once
    pub fn evaluate<'a>(&'a self, metadata: &Metadata, mut on_match: impl FnMut(&'a EntryCore)) {
        let mut first: Option<EntryId> = None;
        for addr in metadata.addresses() {
            let Some((entry, _)) = self.lookup(addr) else {
                continue;
            };
            let id = entry.core.id();
            if first == Some(id) {
                continue;
            }
            first = Some(id);
            entry.core.record_match();
            self.matches.inc();
            on_match(&entry.core);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &AddressEntry> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.exact4.len() + self.exact6.len() + self.trie4.len + self.trie6.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matches across the table's lifetime, removed entries included
    pub fn matches(&self) -> u64 {
        self.matches.get()
    }

    pub fn stats(&self) -> AddressTableStats {
        AddressTableStats {
            hash4: self.counters.hash4.get(),
            hash6: self.counters.hash6.get(),
            cidr4: self.counters.cidr4.get(),
            cidr6: self.counters.cidr6.get(),
        }
    }
}

/// Parse CIDR text and clear host bits
fn parse_cidr(cidr: &str) -> Result<IpNetwork> {
    let net: IpNetwork = cidr
        .trim()
        .parse()
        .map_err(|_| ChainError::InvalidAddress(cidr.to_string()))?;
    IpNetwork::new(net.network(), net.prefix()).map_err(|_| ChainError::InvalidAddress(cidr.to_string()))
}

/// Addresses are left-aligned in a u128 so both families share one trie shape
#[inline]
fn key4(octets: [u8; 4]) -> u128 {
    (u32::from_be_bytes(octets) as u128) << 96
}

#[inline]
fn key6(octets: [u8; 16]) -> u128 {
    u128::from_be_bytes(octets)
}

#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: [Option<u32>; 2],
    entry: Option<EntryId>,
}

/// Binary trie over left-aligned prefixes
#[derive(Debug, Clone)]
struct PrefixTrie {
    nodes: Vec<TrieNode>,
    len: usize,
}

impl Default for PrefixTrie {
    fn default() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
            len: 0,
        }
    }
}

#[inline(always)]
fn bit(key: u128, depth: u8) -> usize {
    ((key >> (127 - depth as u32)) & 1) as usize
}

impl PrefixTrie {
    /// Caller has already checked the slot is empty
    fn insert(&mut self, key: u128, prefix_len: u8, id: EntryId) {
        let mut node = 0usize;
        for depth in 0..prefix_len {
            let b = bit(key, depth);
            node = match self.nodes[node].children[b] {
                Some(child) => child as usize,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children[b] = Some(child as u32);
                    child
                }
            };
        }
        if self.nodes[node].entry.replace(id).is_none() {
            self.len += 1;
        }
    }

    fn node_at(&self, key: u128, prefix_len: u8) -> Option<usize> {
        let mut node = 0usize;
        for depth in 0..prefix_len {
            node = self.nodes[node].children[bit(key, depth)]? as usize;
        }
        Some(node)
    }

    fn get(&self, key: u128, prefix_len: u8) -> Option<EntryId> {
        self.nodes[self.node_at(key, prefix_len)?].entry
    }

    fn remove(&mut self, key: u128, prefix_len: u8) -> Option<EntryId> {
        let node = self.node_at(key, prefix_len)?;
        let removed = self.nodes[node].entry.take();
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Deepest entry on the path of `key`
    fn longest_match(&self, key: u128) -> Option<EntryId> {
        let mut node = 0usize;
        let mut best = self.nodes[0].entry;
        for depth in 0..128u8 {
            match self.nodes[node].children[bit(key, depth)] {
                Some(child) => {
                    node = child as usize;
                    if let Some(id) = self.nodes[node].entry {
                        best = Some(id);
                    }
                }
                None => break,
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ContentType, QueueDescriptor, QueueFormat, SocketKind};
    use sensor_common::frame::testing::tcp4;
    use sensor_common::{Direction, FrameView, HeaderExtractor, MetadataExtractor};

    fn queue(registry: &InprocRegistry) -> OutputQueue {
        OutputQueue::open(
            QueueDescriptor {
                url: "inproc://cidr".into(),
                kind: SocketKind::Pub,
                format: QueueFormat::Metadata,
                content: ContentType::Pcap,
            },
            registry,
        )
        .unwrap()
    }

    fn lookup_name(table: &AddressTable, addr: &str) -> Option<String> {
        table
            .lookup(addr.parse().unwrap())
            .map(|(e, _)| e.network().to_string())
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = InprocRegistry::new();
        let mut table = AddressTable::new();
        table.add("wide", "10.0.0.0/8", queue(&registry)).unwrap();
        table.add("narrow", "10.1.0.0/16", queue(&registry)).unwrap();

        assert_eq!(lookup_name(&table, "10.1.2.3").as_deref(), Some("10.1.0.0/16"));
        assert_eq!(lookup_name(&table, "10.2.2.3").as_deref(), Some("10.0.0.0/8"));
        assert_eq!(lookup_name(&table, "192.168.1.1"), None);
        assert_eq!(table.stats().cidr4, 2);
    }

    #[test]
    fn test_exact_short_circuits_prefix() {
        let registry = InprocRegistry::new();
        let mut table = AddressTable::new();
        table.add("net", "192.168.0.0/16", queue(&registry)).unwrap();
        table.add("host", "192.168.1.1", queue(&registry)).unwrap();

        let (entry, kind) = table.lookup("192.168.1.1".parse().unwrap()).unwrap();
        assert_eq!(kind, LookupKind::Exact);
        assert_eq!(entry.core().name(), "host");
        assert_eq!(
            table.stats(),
            AddressTableStats { hash4: 1, ..Default::default() }
        );

        let (_, kind) = table.lookup("192.168.1.2".parse().unwrap()).unwrap();
        assert_eq!(kind, LookupKind::Prefix);
        assert_eq!(table.stats().cidr4, 1);
    }

    #[test]
    fn test_ipv6() {
        let registry = InprocRegistry::new();
        let mut table = AddressTable::new();
        table.add("doc", "2001:db8::/32", queue(&registry)).unwrap();
        table.add("host", "2001:db8::1/128", queue(&registry)).unwrap();
        table.add("default", "::/0", queue(&registry)).unwrap();

        assert_eq!(lookup_name(&table, "2001:db8::1").as_deref(), Some("2001:db8::1/128"));
        assert_eq!(lookup_name(&table, "2001:db8::2").as_deref(), Some("2001:db8::/32"));
        assert_eq!(lookup_name(&table, "fe80::1").as_deref(), Some("::/0"));
        let stats = table.stats();
        assert_eq!((stats.hash6, stats.cidr6), (1, 2));
    }

    #[test]
    fn test_duplicates_rejected_and_canonicalized() {
        let registry = InprocRegistry::new();
        let mut table = AddressTable::new();
        table.add("first", "10.1.2.3/8", queue(&registry)).unwrap();

        let dup = table.add("second", "10.0.0.0/8", queue(&registry));
        assert!(matches!(dup, Err(ChainError::DuplicatePrefix(p)) if p == "10.0.0.0/8"));
        assert_eq!(lookup_name(&table, "10.9.9.9").as_deref(), Some("10.0.0.0/8"));
        assert_eq!(table.lookup("10.9.9.9".parse().unwrap()).unwrap().0.core().name(), "first");
        assert_eq!(table.len(), 1);

        assert!(matches!(table.add("bad", "10.0.0.0/33", queue(&registry)), Err(ChainError::InvalidAddress(_))));
    }

    #[test]
    fn test_remove_by_cidr() {
        let registry = InprocRegistry::new();
        let mut table = AddressTable::new();
        table.add("wide", "10.0.0.0/8", queue(&registry)).unwrap();
        table.add("narrow", "10.1.0.0/16", queue(&registry)).unwrap();
        table.add("host", "10.1.1.1", queue(&registry)).unwrap();

        assert_eq!(table.remove("10.1.0.0/16").unwrap().unwrap().core().name(), "narrow");
        assert!(table.remove("10.1.0.0/16").unwrap().is_none());
        assert_eq!(lookup_name(&table, "10.1.2.3").as_deref(), Some("10.0.0.0/8"));

        assert!(table.remove("10.1.1.1/32").unwrap().is_some());
        assert_eq!(lookup_name(&table, "10.1.1.1").as_deref(), Some("10.0.0.0/8"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.entries().count(), 1);

        // slot freed, prefix can come back
        table.add("narrow", "10.1.0.0/16", queue(&registry)).unwrap();
        assert_eq!(lookup_name(&table, "10.1.2.3").as_deref(), Some("10.1.0.0/16"));
    }

    #[test]
    fn test_evaluate_counts_shared_entry_once() {
        let registry = InprocRegistry::new();
        let mut table = AddressTable::new();
        let lan = table.add("lan", "10.0.0.0/8", queue(&registry)).unwrap();
        let ext = table.add("ext", "8.8.8.8", queue(&registry)).unwrap();

        let extractor = HeaderExtractor::default();
        let internal = tcp4([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 0);
        let outbound = tcp4([10, 0, 0, 1], [8, 8, 8, 8], 1, 53, 0);

        let mut hits = Vec::new();
        for frame in [&internal, &outbound] {
            let view = FrameView::parse(frame).unwrap();
            let md = extractor.extract(0, Direction::Rx, &view);
            table.evaluate(&md, |e| hits.push(e.id()));
        }

        assert_eq!(hits, vec![lan, lan, ext]);
        let matches: Vec<u64> = table.entries().map(|e| e.core().matches()).collect();
        assert_eq!(matches, vec![2, 1]);
        assert_eq!(table.matches(), 3);
    }

    #[test]
    fn test_table_total_survives_removal() {
        let registry = InprocRegistry::new();
        let mut table = AddressTable::new();
        table.add("lan", "10.0.0.0/8", queue(&registry)).unwrap();
        table.add("ext", "8.8.8.8", queue(&registry)).unwrap();

        let frame = tcp4([10, 0, 0, 1], [8, 8, 8, 8], 1, 53, 0);
        let view = FrameView::parse(&frame).unwrap();
        let md = HeaderExtractor::default().extract(0, Direction::Rx, &view);
        table.evaluate(&md, |_| {});
        assert_eq!(table.matches(), 2);

        table.remove("8.8.8.8").unwrap();
        let live: u64 = table.entries().map(|e| e.core().matches()).sum();
        assert_eq!(live, 1);
        assert_eq!(table.matches(), 2);
    }

    #[test]
    fn test_from_config() {
        let registry = InprocRegistry::new();
        let entries = vec![
            serde_json::json!({"cidr": "172.16.0.0/12", "nm_queue_url": "inproc://t", "nm_queue_type": "PUB"}),
            serde_json::json!({"cidr": "172.16.0.0/12", "nm_queue_url": "inproc://t", "nm_queue_type": "PUB"}),
            serde_json::json!({"cidr": "not-an-address", "nm_queue_url": "inproc://t", "nm_queue_type": "PUB"}),
            serde_json::json!({"nm_queue_url": "inproc://t", "nm_queue_type": "PUB"}),
        ];
        let table = AddressTable::from_config(&entries, &registry);
        assert_eq!(table.len(), 1);
        assert_eq!(table.entries().next().unwrap().core().name(), "172.16.0.0/12");
    }
}
