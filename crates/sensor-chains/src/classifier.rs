//! Classifier
//!
//! Runs one packet through the filter chain, the pattern chain and the
//! address table, in that order, and publishes every match to the matching
//! entry's queue.

use crate::address_table::AddressTable;
use crate::filter_chain::FilterChain;
use crate::pattern_chain::PatternChain;
use crate::queue::{ContentType, InprocRegistry, QueueFormat};
use crate::EntryCore;
use chrono::{DateTime, Utc};
use sensor_common::{FrameView, Metadata, SensorConfig};
use serde::Serialize;
use std::sync::Arc;

/// Which chain produced a match
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Pcap,
    Re,
    Cidr,
}

/// JSON body published by metadata-format queues
#[derive(Debug, Serialize)]
pub struct MatchRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub chain: ChainKind,
    pub entry: &'a str,
    pub content: ContentType,
    pub metadata: &'a Metadata,
}

/// All three chains, built once from configuration
#[derive(Debug, Default)]
pub struct ChainSet {
    pub filter: FilterChain,
    pub pattern: PatternChain,
    pub table: AddressTable,
}

impl ChainSet {
    /// Build every chain; bad entries are logged and left out
    pub fn from_config(config: &SensorConfig, registry: &InprocRegistry) -> Self {
        let chains = Self {
            filter: FilterChain::from_config(&config.pcap_chain, registry),
            pattern: PatternChain::from_config(&config.re_chain, registry),
            table: AddressTable::from_config(&config.cidr_table, registry),
        };
        tracing::info!(
            pcap = chains.filter.len(),
            re = chains.pattern.len(),
            cidr = chains.table.len(),
            "chains loaded"
        );
        chains
    }
}

/// Per-packet entry point into the chains
#[derive(Debug, Clone)]
pub struct Classifier {
    chains: Arc<ChainSet>,
}

impl Classifier {
    pub fn new(chains: Arc<ChainSet>) -> Self {
        Self { chains }
    }

    pub fn chains(&self) -> &ChainSet {
        &self.chains
    }

    /// Classify one packet; returns how many entries matched
    pub fn classify(&self, frame: &FrameView<'_>, metadata: &Metadata) -> usize {
        let mut matched = 0;

        self.chains.filter.evaluate(frame, |entry| {
            publish(entry, ChainKind::Pcap, frame, metadata);
            matched += 1;
        });
        self.chains.pattern.evaluate(metadata, |entry| {
            publish(entry, ChainKind::Re, frame, metadata);
            matched += 1;
        });
        self.chains.table.evaluate(metadata, |entry| {
            publish(entry, ChainKind::Cidr, frame, metadata);
            matched += 1;
        });

        matched
    }
}

fn publish(entry: &EntryCore, chain: ChainKind, frame: &FrameView<'_>, metadata: &Metadata) {
    let queue = entry.queue();
    match queue.format() {
        QueueFormat::Packet => {
            queue.publish(frame.data());
        }
        QueueFormat::Metadata => {
            let record = MatchRecord {
                timestamp: Utc::now(),
                chain,
                entry: entry.name(),
                content: queue.content(),
                metadata,
            };
            match serde_json::to_vec(&record) {
                Ok(body) => {
                    queue.publish(&body);
                }
                Err(e) => tracing::warn!(error = %e, entry = entry.name(), "match record encoding failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_common::frame::testing::{tcp4, udp4};
    use sensor_common::{Direction, HeaderExtractor, MetadataExtractor};

    fn sensor_config(json: &str) -> SensorConfig {
        SensorConfig::from_json(json).unwrap()
    }

    fn run(classifier: &Classifier, frame: &[u8]) -> usize {
        let view = FrameView::parse(frame).unwrap();
        let md = HeaderExtractor::default().extract(0, Direction::Rx, &view);
        classifier.classify(&view, &md)
    }

    #[test]
    fn test_http_scenario() {
        let registry = InprocRegistry::new();
        let rx = registry.subscribe("inproc://http", 16);
        let config = sensor_config(
            r#"{
                "ports": [{"interface": "ring0"}],
                "pcap_chain": [{
                    "name": "http",
                    "filter": "tcp port 80",
                    "nm_queue_url": "inproc://http",
                    "nm_queue_type": "PUSH"
                }]
            }"#,
        );
        let classifier = Classifier::new(Arc::new(ChainSet::from_config(&config, &registry)));

        for i in 0..3u16 {
            run(&classifier, &tcp4([10, 0, 0, 2], [10, 0, 0, 1], 40000 + i, 80, 0x18));
        }
        run(&classifier, &tcp4([10, 0, 0, 2], [10, 0, 0, 1], 40000, 443, 0x18));
        run(&classifier, &udp4([10, 0, 0, 2], [10, 0, 0, 1], 5353, 53, b""));

        let entry = classifier.chains().filter.entries()[0].core();
        assert_eq!(entry.matches(), 3);
        assert_eq!(entry.queue().stats().tx_messages, 3);

        let body = rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["chain"], "pcap");
        assert_eq!(json["entry"], "http");
        assert_eq!(json["content"], "pcap");
        assert_eq!(json["metadata"]["dport"], 80);
    }

    #[test]
    fn test_one_packet_many_chains() {
        let registry = InprocRegistry::new();
        let raw = registry.subscribe("inproc://raw", 4);
        let config = sensor_config(
            r#"{
                "ports": [{"interface": "ring0"}],
                "pcap_chain": [{"filter": "tcp", "nm_queue_url": "inproc://raw", "nm_queue_type": "PAIR", "nm_queue_format": "packet"}],
                "re_chain": [{"re": "example", "invert": true, "nm_queue_url": "inproc://re", "nm_queue_type": "PUB"}],
                "cidr_table": [
                    {"cidr": "10.0.0.0/8", "nm_queue_url": "inproc://cidr", "nm_queue_type": "PUB"},
                    {"cidr": "10.0.0.1", "nm_queue_url": "inproc://cidr", "nm_queue_type": "PUB"}
                ]
            }"#,
        );
        let classifier = Classifier::new(Arc::new(ChainSet::from_config(&config, &registry)));

        let frame = tcp4([10, 0, 0, 2], [10, 0, 0, 1], 1, 2, 0);
        // filter + /8 for the source + host for the destination; the inverted
        // pattern skips a record with no DNS name
        assert_eq!(run(&classifier, &frame), 3);
        assert_eq!(classifier.chains().pattern.matches(), 0);
        assert_eq!(raw.try_recv().unwrap().as_ref(), frame.as_slice());

        let stats = classifier.chains().table.stats();
        assert_eq!((stats.hash4, stats.cidr4), (1, 1));
    }
}
