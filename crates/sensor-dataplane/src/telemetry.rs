//! Periodic telemetry from the reporting core
//!
//! Port counters are read and reset on every report; chain, entry and queue
//! counters are cumulative.

use crate::context::SensorContext;
use crate::stats::PortStats;
use sensor_chains::{AddressTableStats, ChainKind, EntryCore, QueueStatsSnapshot};
use sensor_common::PortId;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct PortReport {
    pub port: PortId,
    pub link_up: bool,
    #[serde(flatten)]
    pub stats: PortStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub chain: ChainKind,
    pub id: u32,
    pub name: String,
    pub matches: u64,
    pub queue: QueueStatsSnapshot,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChainTotals {
    pub pcap: u64,
    pub re: u64,
    pub cidr: u64,
}

/// One telemetry report
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryReport {
    pub ports: Vec<PortReport>,
    pub chains: ChainTotals,
    pub table: AddressTableStats,
    pub entries: Vec<EntryReport>,
}

impl TelemetryReport {
    /// Snapshot the context, zeroing port counters
    pub fn collect(ctx: &SensorContext) -> Self {
        let io = ctx.io();
        let ports = ctx
            .port_stats()
            .take_all()
            .into_iter()
            .enumerate()
            .map(|(id, stats)| PortReport {
                port: id as PortId,
                link_up: io.link_status(id as PortId).up,
                stats,
            })
            .collect();

        let chains = ctx.chains();
        let mut entries = Vec::new();
        let mut push = |chain: ChainKind, core: &EntryCore| {
            entries.push(EntryReport {
                chain,
                id: core.id(),
                name: core.name().to_string(),
                matches: core.matches(),
                queue: core.queue().stats(),
            })
        };
        chains.filter.entries().iter().for_each(|e| push(ChainKind::Pcap, e.core()));
        chains.pattern.entries().iter().for_each(|e| push(ChainKind::Re, e.core()));
        chains.table.entries().for_each(|e| push(ChainKind::Cidr, e.core()));

        let totals = ChainTotals {
            pcap: chains.filter.matches(),
            re: chains.pattern.matches(),
            cidr: chains.table.matches(),
        };

        Self {
            ports,
            chains: totals,
            table: chains.table.stats(),
            entries,
        }
    }

    /// Write the report as structured log lines
    pub fn emit(&self) {
        for p in &self.ports {
            tracing::info!(
                port = p.port,
                link_up = p.link_up,
                rx = p.stats.rx,
                tx = p.stats.tx,
                dropped = p.stats.dropped,
                "port stats"
            );
        }
        tracing::info!(
            pcap = self.chains.pcap,
            re = self.chains.re,
            cidr = self.chains.cidr,
            hash4 = self.table.hash4,
            hash6 = self.table.hash6,
            cidr4 = self.table.cidr4,
            cidr6 = self.table.cidr6,
            "chain stats"
        );
        for e in &self.entries {
            tracing::debug!(
                chain = ?e.chain,
                id = e.id,
                name = %e.name,
                matches = e.matches,
                tx_messages = e.queue.tx_messages,
                tx_bytes = e.queue.tx_bytes,
                tx_discards = e.queue.tx_discards,
                "entry stats"
            );
        }
    }
}

/// Report timer
#[derive(Debug)]
pub struct Telemetry {
    interval: Duration,
    last: Instant,
}

impl Telemetry {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last: now }
    }

    /// Report if the interval has passed
    pub fn poll(&mut self, ctx: &SensorContext, now: Instant) -> Option<TelemetryReport> {
        if now.saturating_duration_since(self.last) < self.interval {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last);
        self.last = now;

        let report = TelemetryReport::collect(ctx);
        tracing::info!(elapsed_secs = elapsed.as_secs_f64(), "telemetry");
        report.emit();
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RingPorts;
    use sensor_common::frame::testing::tcp4;
    use sensor_common::{Direction, FrameView, MetadataExtractor, SensorConfig};
    use std::sync::Arc;

    fn context() -> SensorContext {
        let config = SensorConfig::from_json(
            r#"{
                "ports": [{"interface": "ring0"}],
                "pcap_chain": [{"name": "any", "filter": "", "nm_queue_url": "inproc://any", "nm_queue_type": "PUB"}],
                "cidr_table": [{"cidr": "10.0.0.0/8", "nm_queue_url": "inproc://ten", "nm_queue_type": "PUB"}]
            }"#,
        )
        .unwrap();
        SensorContext::new(config, Arc::new(RingPorts::new(1, 1, 8))).unwrap()
    }

    #[test]
    fn test_collect_resets_ports() {
        let ctx = context();
        ctx.port_stats().record_rx(0, 12);
        ctx.port_stats().record_tx(0, 3, 1);

        let report = TelemetryReport::collect(&ctx);
        assert_eq!(report.ports[0].stats.rx, 12);
        assert_eq!(report.ports[0].stats.dropped, 1);
        assert!(report.ports[0].link_up);
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].name, "any");
        assert_eq!(report.entries[1].chain, ChainKind::Cidr);

        let again = TelemetryReport::collect(&ctx);
        assert_eq!(again.ports[0].stats, PortStats::default());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["ports"][0]["rx"], 12);
    }

    #[test]
    fn test_chain_totals() {
        let ctx = context();
        for dst in [[10, 0, 0, 1], [192, 168, 0, 1]] {
            let frame = tcp4([10, 0, 0, 2], dst, 1, 80, 0);
            let view = FrameView::parse(&frame).unwrap();
            let md = ctx.extractor().extract(0, Direction::Rx, &view);
            ctx.classifier().classify(&view, &md);
        }

        let report = TelemetryReport::collect(&ctx);
        assert_eq!(report.chains.pcap, 2);
        assert_eq!(report.chains.cidr, 2);
        assert_eq!(report.chains.re, 0);
    }

    #[test]
    fn test_poll_interval() {
        let ctx = context();
        let start = Instant::now();
        let mut telemetry = Telemetry::new(Duration::from_secs(10), start);
        assert!(telemetry.poll(&ctx, start + Duration::from_secs(5)).is_none());
        assert!(telemetry.poll(&ctx, start + Duration::from_secs(10)).is_some());
        assert!(telemetry.poll(&ctx, start + Duration::from_secs(15)).is_none());
    }
}
