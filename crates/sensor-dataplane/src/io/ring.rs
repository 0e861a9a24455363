//! In-memory ports
//!
//! Lock-free bounded rings stand in for NIC descriptor rings. Frames are
//! injected on the RX side and collected from the TX side, which makes the
//! whole worker loop drivable from tests and benchmarks.

use super::{BurstIo, IoError, LinkStatus, Packet};
use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use sensor_common::{AtomicCounter, MacAddr, PortId, QueueId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

struct RingPort {
    mac: MacAddr,
    rx: Vec<ArrayQueue<Bytes>>,
    tx: Vec<ArrayQueue<Bytes>>,
    registered: Vec<AtomicBool>,
    link_up: AtomicBool,
    rx_missed: AtomicCounter,
}

#[derive(Default)]
struct WaitState {
    wakes: u64,
}

/// Ring-backed ports
pub struct RingPorts {
    ports: Vec<RingPort>,
    state: Mutex<WaitState>,
    ready: Condvar,
    closed: AtomicBool,
}

impl RingPorts {
    /// `ports` ports, each with `queues` RX/TX ring pairs of `ring_size` slots
    pub fn new(ports: usize, queues: usize, ring_size: usize) -> Self {
        let ring_size = ring_size.max(1);
        let ports = (0..ports)
            .map(|p| RingPort {
                mac: MacAddr([0x02, 0, 0, 0, (p >> 8) as u8, (p as u8).wrapping_add(1)]),
                rx: (0..queues).map(|_| ArrayQueue::new(ring_size)).collect(),
                tx: (0..queues).map(|_| ArrayQueue::new(ring_size)).collect(),
                registered: (0..queues).map(|_| AtomicBool::new(false)).collect(),
                link_up: AtomicBool::new(true),
                rx_missed: AtomicCounter::default(),
            })
            .collect();

        Self {
            ports,
            state: Mutex::new(WaitState::default()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn port(&self, port: PortId) -> Option<&RingPort> {
        self.ports.get(port as usize)
    }

    /// Put a frame on an RX ring; false when the ring is full or closed
    pub fn inject(&self, port: PortId, queue: QueueId, frame: impl Into<Bytes>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let Some(ring) = self.port(port).and_then(|p| p.rx.get(queue as usize)) else {
            return false;
        };
        if ring.push(frame.into()).is_err() {
            if let Some(p) = self.port(port) {
                p.rx_missed.inc();
            }
            return false;
        }

        let _state = self.state.lock();
        self.ready.notify_all();
        true
    }

    /// Drain every TX ring of a port, queue by queue
    pub fn collect(&self, port: PortId) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Some(p) = self.port(port) {
            for ring in &p.tx {
                while let Some(frame) = ring.pop() {
                    out.push(frame);
                }
            }
        }
        out
    }

    /// Frames waiting on an RX ring
    pub fn pending(&self, port: PortId, queue: QueueId) -> usize {
        self.port(port)
            .and_then(|p| p.rx.get(queue as usize))
            .map_or(0, ArrayQueue::len)
    }

    /// Frames refused because the RX ring was full
    pub fn rx_missed(&self, port: PortId) -> u64 {
        self.port(port).map_or(0, |p| p.rx_missed.get())
    }

    pub fn set_link(&self, port: PortId, up: bool) {
        if let Some(p) = self.port(port) {
            p.link_up.store(up, Ordering::Relaxed);
        }
    }

    fn any_ready(&self, queue: QueueId) -> bool {
        self.ports.iter().any(|p| {
            let q = queue as usize;
            p.registered.get(q).map_or(false, |r| r.load(Ordering::Relaxed))
                && p.rx.get(q).map_or(false, |ring| !ring.is_empty())
        })
    }
}

impl BurstIo for RingPorts {
    fn port_count(&self) -> usize {
        self.ports.len()
    }

    fn receive_burst(&self, port: PortId, queue: QueueId, out: &mut Vec<Packet>, max: usize) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let Some(ring) = self.port(port).and_then(|p| p.rx.get(queue as usize)) else {
            return 0;
        };

        let mut count = 0;
        while count < max {
            match ring.pop() {
                Some(data) => {
                    out.push(Packet { data, port });
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    fn transmit_burst(&self, port: PortId, queue: QueueId, packets: &[Packet]) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let Some(ring) = self.port(port).and_then(|p| p.tx.get(queue as usize)) else {
            return 0;
        };

        let mut sent = 0;
        for packet in packets {
            if ring.push(packet.data.clone()).is_err() {
                break;
            }
            sent += 1;
        }
        sent
    }

    fn rx_descriptor_done(&self, port: PortId, queue: QueueId, offset: u16) -> bool {
        self.pending(port, queue) > offset as usize
    }

    fn link_status(&self, port: PortId) -> LinkStatus {
        LinkStatus {
            up: self.port(port).map_or(false, |p| p.link_up.load(Ordering::Relaxed)),
            speed_mbps: 10_000,
        }
    }

    fn mac_addr(&self, port: PortId) -> Option<MacAddr> {
        self.port(port).map(|p| p.mac)
    }

    fn rx_interrupt_register(&self, port: PortId, queue: QueueId) -> Result<(), IoError> {
        let flag = self
            .port(port)
            .ok_or(IoError::NoSuchPort(port))?
            .registered
            .get(queue as usize)
            .ok_or(IoError::NoSuchQueue { port, queue })?;
        flag.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn rx_interrupt_enable(&self, port: PortId, queue: QueueId) -> Result<(), IoError> {
        let registered = self
            .port(port)
            .and_then(|p| p.registered.get(queue as usize))
            .map_or(false, |r| r.load(Ordering::Relaxed));
        if registered {
            Ok(())
        } else {
            Err(IoError::InterruptsUnsupported)
        }
    }

    fn rx_interrupt_wait(&self, queue: QueueId, timeout: Option<Duration>) -> Result<(), IoError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let wakes = state.wakes;

        loop {
            if self.closed.load(Ordering::Acquire) || state.wakes != wakes || self.any_ready(queue) {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        return Ok(());
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    fn wake(&self) {
        let mut state = self.state.lock();
        state.wakes = state.wakes.wrapping_add(1);
        self.ready.notify_all();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake();
    }
}
