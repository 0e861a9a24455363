//! Burst I/O
//!
//! The worker loop talks to ports only through [`BurstIo`]: bounded bursts in
//! and out on a per-core queue, pending-descriptor probes for the frequency
//! heuristic, and a receive-ready wait for the idle path. Port bring-up
//! happens before the trait object is handed to the engine.

pub mod ring;

#[cfg(target_os = "linux")]
pub mod packet_socket;

pub use ring::RingPorts;

#[cfg(target_os = "linux")]
pub use packet_socket::PacketSocketPorts;

use bytes::Bytes;
use sensor_common::{MacAddr, PortId, QueueId};
use std::time::Duration;
use thiserror::Error;

/// One received or outgoing frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Frame bytes
    pub data: Bytes,
    /// Ingress or egress port
    pub port: PortId,
}

impl Packet {
    pub fn new(port: PortId, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            port,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Link state of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub up: bool,
    /// Speed in Mbps, 0 when unknown
    pub speed_mbps: u32,
}

/// Port I/O errors
#[derive(Error, Debug)]
pub enum IoError {
    #[error("port {port} ({interface}): {source}")]
    PortSetup {
        port: PortId,
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no such port: {0}")]
    NoSuchPort(PortId),

    #[error("no such queue {queue} on port {port}")]
    NoSuchQueue { port: PortId, queue: QueueId },

    #[error("receive interrupts unsupported")]
    InterruptsUnsupported,

    #[error("IO error: {0}")]
    Os(#[from] std::io::Error),
}

/// Pre-configured ports with one RX/TX queue pair per worker core
pub trait BurstIo: Send + Sync {
    /// Number of ports
    fn port_count(&self) -> usize;

    /// Append up to `max` frames from `port`/`queue` to `out`; returns how many
    fn receive_burst(&self, port: PortId, queue: QueueId, out: &mut Vec<Packet>, max: usize) -> usize;

    /// Send frames in order; returns how many were accepted, always a prefix
    fn transmit_burst(&self, port: PortId, queue: QueueId, packets: &[Packet]) -> usize;

    /// Whether a received descriptor is pending `offset` slots deep
    fn rx_descriptor_done(&self, port: PortId, queue: QueueId, offset: u16) -> bool;

    fn link_status(&self, port: PortId) -> LinkStatus;

    /// Hardware address, if known
    fn mac_addr(&self, port: PortId) -> Option<MacAddr>;

    /// Make `port`/`queue` a wake source for [`BurstIo::rx_interrupt_wait`]
    fn rx_interrupt_register(&self, port: PortId, queue: QueueId) -> Result<(), IoError>;

    /// Arm the one-shot wake source before waiting
    fn rx_interrupt_enable(&self, port: PortId, queue: QueueId) -> Result<(), IoError>;

    /// Block until any registered port has frames on `queue`, [`BurstIo::wake`]
    /// is called, or `timeout` passes
    fn rx_interrupt_wait(&self, queue: QueueId, timeout: Option<Duration>) -> Result<(), IoError>;

    /// Release every waiter
    fn wake(&self);

    /// Shut the ports; later bursts return nothing
    fn close(&self);
}
