//! Sensor context
//!
//! Everything the workers share, built once before the first worker starts:
//! configuration, chains, the in-process transport registry, port
//! identities, port counters and the shutdown flag. Nothing here is global,
//! so several sensors can live in one process.

use crate::io::BurstIo;
use crate::power::{FrequencyScaler, NoopScaler};
use crate::protocol::PortIdentity;
use crate::stats::PortStatsTable;
use crate::EngineError;
use sensor_chains::{ChainSet, Classifier, InprocRegistry};
use sensor_common::{HeaderExtractor, MacAddr, PortId, SensorConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared state for one sensor instance
pub struct SensorContext {
    config: SensorConfig,
    registry: InprocRegistry,
    classifier: Classifier,
    extractor: HeaderExtractor,
    identities: Vec<PortIdentity>,
    port_stats: PortStatsTable,
    io: Arc<dyn BurstIo>,
    scaler: Arc<dyn FrequencyScaler>,
    running: AtomicBool,
}

impl SensorContext {
    /// Build the chains and port state; frequency scaling is a no-op
    pub fn new(config: SensorConfig, io: Arc<dyn BurstIo>) -> Result<Self, EngineError> {
        Self::with_scaler(config, io, Arc::new(NoopScaler))
    }

    pub fn with_scaler(
        config: SensorConfig,
        io: Arc<dyn BurstIo>,
        scaler: Arc<dyn FrequencyScaler>,
    ) -> Result<Self, EngineError> {
        Self::with_registry(config, io, scaler, InprocRegistry::new())
    }

    /// Build against a registry whose consumers are already attached
    pub fn with_registry(
        config: SensorConfig,
        io: Arc<dyn BurstIo>,
        scaler: Arc<dyn FrequencyScaler>,
        registry: InprocRegistry,
    ) -> Result<Self, EngineError> {
        if io.port_count() < config.ports.len() {
            return Err(EngineError::PortMismatch {
                configured: config.ports.len(),
                available: io.port_count(),
            });
        }

        let identities: Vec<PortIdentity> = config
            .ports
            .iter()
            .enumerate()
            .map(|(id, port)| {
                let mac = port
                    .mac
                    .or_else(|| io.mac_addr(id as PortId))
                    .unwrap_or_default();
                if mac == MacAddr::default() {
                    tracing::warn!(port = id, interface = %port.interface, "no hardware address, replies disabled");
                }
                PortIdentity::new(mac, &port.ip_addrs)
            })
            .collect();

        let extractor = HeaderExtractor::new(config.ports.iter().flat_map(|p| p.ip_addrs.iter().copied()));
        let chains = ChainSet::from_config(&config, &registry);
        let port_stats = PortStatsTable::new(config.ports.len());

        Ok(Self {
            config,
            registry,
            classifier: Classifier::new(Arc::new(chains)),
            extractor,
            identities,
            port_stats,
            io,
            scaler,
            running: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// In-process endpoints; consumers attach here
    pub fn registry(&self) -> &InprocRegistry {
        &self.registry
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn chains(&self) -> &ChainSet {
        self.classifier.chains()
    }

    pub fn extractor(&self) -> &HeaderExtractor {
        &self.extractor
    }

    /// Reply addresses, with unknown MACs left as all-zero
    pub fn identities(&self) -> &[PortIdentity] {
        &self.identities
    }

    pub fn port_stats(&self) -> &PortStatsTable {
        &self.port_stats
    }

    pub fn port_count(&self) -> usize {
        self.config.ports.len()
    }

    pub fn io(&self) -> &Arc<dyn BurstIo> {
        &self.io
    }

    pub fn scaler(&self) -> &Arc<dyn FrequencyScaler> {
        &self.scaler
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Ask every worker to leave its loop and release any blocked one
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.io.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RingPorts;

    fn config(ports: usize) -> SensorConfig {
        let ports: Vec<String> = (0..ports)
            .map(|i| format!(r#"{{"interface": "ring{}", "ip_addrs": ["10.0.0.{}"]}}"#, i, i + 1))
            .collect();
        SensorConfig::from_json(&format!(
            r#"{{
                "ports": [{}],
                "cidr_table": [{{"cidr": "10.0.0.0/8", "nm_queue_url": "inproc://ten", "nm_queue_type": "PUB"}}]
            }}"#,
            ports.join(",")
        ))
        .unwrap()
    }

    #[test]
    fn test_context_from_config() {
        let io = Arc::new(RingPorts::new(2, 1, 8));
        let ctx = SensorContext::new(config(2), io.clone()).unwrap();

        assert_eq!(ctx.port_count(), 2);
        assert_eq!(ctx.chains().table.len(), 1);
        assert_eq!(ctx.identities()[1].mac, io.mac_addr(1).unwrap());
        assert!(ctx.extractor().is_local(&"10.0.0.2".parse().unwrap()));
        assert!(ctx.is_running());

        ctx.request_stop();
        assert!(!ctx.is_running());
    }

    #[test]
    fn test_more_ports_than_io() {
        let io = Arc::new(RingPorts::new(1, 1, 8));
        assert!(matches!(
            SensorContext::new(config(2), io),
            Err(EngineError::PortMismatch { configured: 2, available: 1 })
        ));
    }

    #[test]
    fn test_contexts_are_independent() {
        let a = SensorContext::new(config(1), Arc::new(RingPorts::new(1, 1, 8))).unwrap();
        let b = SensorContext::new(config(1), Arc::new(RingPorts::new(1, 1, 8))).unwrap();
        let rx = a.registry().subscribe("inproc://ten", 4);
        assert_eq!(a.registry().endpoint("ten").peer_count(), 1);
        assert_eq!(b.registry().endpoint("ten").peer_count(), 0);
        drop(rx);
    }
}
