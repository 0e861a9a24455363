//! Dataplane Statistics
//!
//! Port counters are shared by every worker and read by the reporting core,
//! so each port sits behind its own lock. Core counters never leave their
//! worker.

use parking_lot::Mutex;
use sensor_common::PortId;
use serde::Serialize;

/// Per-port counters, reset after each telemetry report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PortStats {
    pub rx: u64,
    pub tx: u64,
    pub dropped: u64,
}

/// One lock per port
#[derive(Debug)]
pub struct PortStatsTable {
    ports: Vec<Mutex<PortStats>>,
}

impl PortStatsTable {
    pub fn new(ports: usize) -> Self {
        Self {
            ports: (0..ports).map(|_| Mutex::new(PortStats::default())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    #[inline]
    pub fn record_rx(&self, port: PortId, packets: u64) {
        if let Some(p) = self.ports.get(port as usize) {
            p.lock().rx += packets;
        }
    }

    /// Account one transmit attempt: `sent` accepted, `dropped` discarded
    #[inline]
    pub fn record_tx(&self, port: PortId, sent: u64, dropped: u64) {
        if let Some(p) = self.ports.get(port as usize) {
            let mut stats = p.lock();
            stats.tx += sent;
            stats.dropped += dropped;
        }
    }

    pub fn snapshot(&self, port: PortId) -> PortStats {
        self.ports
            .get(port as usize)
            .map(|p| *p.lock())
            .unwrap_or_default()
    }

    /// Read and zero every port
    pub fn take_all(&self) -> Vec<PortStats> {
        self.ports
            .iter()
            .map(|p| std::mem::take(&mut *p.lock()))
            .collect()
    }
}

/// Per-core counters feeding the frequency heuristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStats {
    /// Packets received since the last power timer
    pub rx_processed: u64,
    /// Loop iterations since the last power timer
    pub loop_iterations: u64,
    /// Time spent sleeping since the last power timer
    pub sleep_usecs: u64,
    /// Scale-up trend accumulator
    pub freq_trend: u32,
}

impl CoreStats {
    /// Mean packets per loop iteration
    pub fn rx_per_iteration(&self) -> u64 {
        if self.loop_iterations == 0 {
            return 0;
        }
        self.rx_processed / self.loop_iterations
    }

    /// Zero the timer window, keeping the trend
    pub fn reset_window(&mut self) {
        self.rx_processed = 0;
        self.loop_iterations = 0;
        self.sleep_usecs = 0;
    }
}
