//! TX batching
//!
//! Each worker keeps one pending batch per port. A batch goes out as soon as
//! it holds a full burst; stragglers wait for the drain timer.

use crate::io::{BurstIo, Packet};
use crate::stats::PortStatsTable;
use sensor_common::{PortId, QueueId};

/// Pending transmit batch for one port
#[derive(Debug)]
pub struct TxBuffer {
    port: PortId,
    capacity: usize,
    pending: Vec<Packet>,
}

impl TxBuffer {
    pub fn new(port: PortId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            port,
            capacity,
            pending: Vec::with_capacity(capacity),
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Add a packet; a full batch is sent right away. Returns packets sent.
    #[inline]
    pub fn enqueue(&mut self, packet: Packet, io: &dyn BurstIo, queue: QueueId, stats: &PortStatsTable) -> usize {
        self.pending.push(packet);
        if self.pending.len() >= self.capacity {
            self.flush(io, queue, stats)
        } else {
            0
        }
    }

    /// Send everything pending. Whatever the port refuses is dropped.
    pub fn flush(&mut self, io: &dyn BurstIo, queue: QueueId, stats: &PortStatsTable) -> usize {
        if self.pending.is_empty() {
            return 0;
        }

        let sent = io.transmit_burst(self.port, queue, &self.pending).min(self.pending.len());
        let dropped = self.pending.len() - sent;
        if dropped > 0 {
            tracing::trace!(port = self.port, sent, dropped, "partial transmit");
        }
        stats.record_tx(self.port, sent as u64, dropped as u64);
        self.pending.clear();
        sent
    }
}
