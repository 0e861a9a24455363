//! AF_PACKET ports
//!
//! One raw packet socket per (port, queue). When a port has more than one
//! queue the sockets join a hash fanout group so the kernel spreads flows
//! across worker cores the way RSS would. The receive-ready wait is a
//! `poll(2)` over the queue's sockets plus an eventfd used by `wake`.

use super::{BurstIo, IoError, LinkStatus, Packet};
use bytes::BytesMut;
use sensor_common::{MacAddr, PortConfig, PortId, QueueId};
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const ETH_P_ALL: u16 = 0x0003;
const PACKET_FANOUT: libc::c_int = 18;
const PACKET_FANOUT_HASH: u32 = 0;
const PACKET_ADD_MEMBERSHIP: libc::c_int = 1;
const PACKET_MR_PROMISC: libc::c_ushort = 1;
const SNAPLEN: usize = 9216;

#[repr(C)]
struct PacketMreq {
    mr_ifindex: libc::c_int,
    mr_type: libc::c_ushort,
    mr_alen: libc::c_ushort,
    mr_address: [libc::c_uchar; 8],
}

struct QueueSocket {
    fd: OwnedFd,
    // last burst hit its limit, so the socket probably still has a backlog
    saturated: AtomicBool,
}

struct PortSockets {
    interface: String,
    mac: Option<MacAddr>,
    queues: Vec<QueueSocket>,
}

/// Live interfaces captured through AF_PACKET
pub struct PacketSocketPorts {
    ports: Vec<PortSockets>,
    wake_fd: OwnedFd,
    closed: AtomicBool,
}

impl PacketSocketPorts {
    /// Open every configured interface with `queues` sockets each
    pub fn open(configs: &[PortConfig], queues: usize) -> Result<Self, IoError> {
        let queues = queues.max(1);
        let mut ports = Vec::with_capacity(configs.len());

        for (port_id, config) in configs.iter().enumerate() {
            let port_id = port_id as PortId;
            let setup = |source: io::Error| IoError::PortSetup {
                port: port_id,
                interface: config.interface.clone(),
                source,
            };

            let ifindex = interface_index(&config.interface).map_err(setup)?;
            let fanout_group = (std::process::id() ^ port_id as u32) & 0xffff;

            let mut sockets = Vec::with_capacity(queues);
            for _ in 0..queues {
                let fd = open_socket(ifindex).map_err(setup)?;
                if config.promiscuous {
                    set_promiscuous(&fd, ifindex).map_err(setup)?;
                }
                if queues > 1 {
                    join_fanout(&fd, fanout_group).map_err(setup)?;
                }
                sockets.push(QueueSocket {
                    fd,
                    saturated: AtomicBool::new(false),
                });
            }

            let mac = config.mac.or_else(|| read_mac(&config.interface));
            tracing::info!(
                port = port_id,
                interface = %config.interface,
                ifindex,
                queues,
                mac = ?mac,
                "packet socket port opened"
            );
            ports.push(PortSockets {
                interface: config.interface.clone(),
                mac,
                queues: sockets,
            });
        }

        // SAFETY: eventfd returns a new descriptor or -1
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(IoError::Os(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else
        let wake_fd = unsafe { OwnedFd::from_raw_fd(raw) };

        Ok(Self {
            ports,
            wake_fd,
            closed: AtomicBool::new(false),
        })
    }

    fn socket(&self, port: PortId, queue: QueueId) -> Option<&QueueSocket> {
        self.ports.get(port as usize)?.queues.get(queue as usize)
    }

    fn drain_wake(&self) {
        let mut value: u64 = 0;
        // SAFETY: reading 8 bytes into a u64 from a non-blocking eventfd
        unsafe {
            libc::read(
                self.wake_fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl BurstIo for PacketSocketPorts {
    fn port_count(&self) -> usize {
        self.ports.len()
    }

    fn receive_burst(&self, port: PortId, queue: QueueId, out: &mut Vec<Packet>, max: usize) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let Some(sock) = self.socket(port, queue) else {
            return 0;
        };

        let mut count = 0;
        let mut buf = BytesMut::with_capacity(SNAPLEN);
        while count < max {
            buf.resize(SNAPLEN, 0);
            // SAFETY: buf holds SNAPLEN writable bytes
            let n = unsafe {
                libc::recv(
                    sock.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    SNAPLEN,
                    libc::MSG_DONTWAIT,
                )
            };
            if n <= 0 {
                break;
            }
            buf.truncate(n as usize);
            out.push(Packet {
                data: buf.split().freeze(),
                port,
            });
            count += 1;
        }

        sock.saturated.store(count == max, Ordering::Relaxed);
        count
    }

    fn transmit_burst(&self, port: PortId, queue: QueueId, packets: &[Packet]) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let Some(sock) = self.socket(port, queue) else {
            return 0;
        };

        let mut sent = 0;
        for packet in packets {
            // SAFETY: pointer and length come from a live slice
            let n = unsafe {
                libc::send(
                    sock.fd.as_raw_fd(),
                    packet.data.as_ptr() as *const libc::c_void,
                    packet.data.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n < 0 {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// The kernel ring depth is not visible through a plain packet socket;
    /// a saturated last burst with data still queued stands in for any depth.
    fn rx_descriptor_done(&self, port: PortId, queue: QueueId, _offset: u16) -> bool {
        let Some(sock) = self.socket(port, queue) else {
            return false;
        };
        if !sock.saturated.load(Ordering::Relaxed) {
            return false;
        }
        let mut next: libc::c_int = 0;
        // SAFETY: FIONREAD writes one c_int
        let rv = unsafe { libc::ioctl(sock.fd.as_raw_fd(), libc::FIONREAD, &mut next) };
        rv == 0 && next > 0
    }

    fn link_status(&self, port: PortId) -> LinkStatus {
        let Some(p) = self.ports.get(port as usize) else {
            return LinkStatus { up: false, speed_mbps: 0 };
        };
        let base = format!("/sys/class/net/{}", p.interface);
        let up = std::fs::read_to_string(format!("{}/operstate", base))
            .map(|s| s.trim() == "up")
            .unwrap_or(false);
        let speed_mbps = std::fs::read_to_string(format!("{}/speed", base))
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|s| *s > 0)
            .map_or(0, |s| s as u32);
        LinkStatus { up, speed_mbps }
    }

    fn mac_addr(&self, port: PortId) -> Option<MacAddr> {
        self.ports.get(port as usize)?.mac
    }

    fn rx_interrupt_register(&self, port: PortId, queue: QueueId) -> Result<(), IoError> {
        self.socket(port, queue)
            .map(|_| ())
            .ok_or(IoError::NoSuchQueue { port, queue })
    }

    fn rx_interrupt_enable(&self, port: PortId, queue: QueueId) -> Result<(), IoError> {
        // sockets are level-triggered; nothing to arm
        self.rx_interrupt_register(port, queue)
    }

    fn rx_interrupt_wait(&self, queue: QueueId, timeout: Option<Duration>) -> Result<(), IoError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut fds: Vec<libc::pollfd> = self
            .ports
            .iter()
            .filter_map(|p| p.queues.get(queue as usize))
            .map(|s| pollfd(s.fd.as_raw_fd()))
            .collect();
        fds.push(pollfd(self.wake_fd.as_raw_fd()));

        let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as libc::c_int);
        // SAFETY: fds is a valid array of pollfd for the duration of the call
        let rv = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(IoError::Os(err));
            }
        }

        if fds.last().map_or(false, |f| f.revents & libc::POLLIN != 0) {
            self.drain_wake();
        }
        Ok(())
    }

    fn wake(&self) {
        let one: u64 = 1;
        // SAFETY: writing 8 bytes from a u64 to an eventfd
        unsafe {
            libc::write(
                self.wake_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wake();
        for (port_id, port) in self.ports.iter().enumerate() {
            tracing::info!(port = port_id, interface = %port.interface, "closing port");
        }
    }
}

fn pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

fn interface_index(name: &str) -> io::Result<libc::c_int> {
    let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: cname is NUL-terminated
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index as libc::c_int)
}

fn open_socket(ifindex: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call
    let raw = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            ETH_P_ALL.to_be() as libc::c_int,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: sockaddr_ll is plain old data
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = ETH_P_ALL.to_be();
    addr.sll_ifindex = ifindex;

    // SAFETY: addr is a valid sockaddr_ll of the stated size
    let rv = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn set_promiscuous(fd: &OwnedFd, ifindex: libc::c_int) -> io::Result<()> {
    let mreq = PacketMreq {
        mr_ifindex: ifindex,
        mr_type: PACKET_MR_PROMISC,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    setsockopt(fd, libc::SOL_PACKET, PACKET_ADD_MEMBERSHIP, &mreq)
}

fn join_fanout(fd: &OwnedFd, group: u32) -> io::Result<()> {
    let arg: u32 = group | (PACKET_FANOUT_HASH << 16);
    setsockopt(fd, libc::SOL_PACKET, PACKET_FANOUT, &arg)
}

fn setsockopt<T>(fd: &OwnedFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    // SAFETY: value points to a live T of the stated size
    let rv = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn read_mac(interface: &str) -> Option<MacAddr> {
    std::fs::read_to_string(format!("/sys/class/net/{}/address", interface))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_fails_setup() {
        let configs = vec![PortConfig {
            interface: "sensor-test-does-not-exist0".into(),
            mac: None,
            ip_addrs: Vec::new(),
            promiscuous: false,
        }];
        match PacketSocketPorts::open(&configs, 1) {
            Err(IoError::PortSetup { port, interface, .. }) => {
                assert_eq!(port, 0);
                assert_eq!(interface, "sensor-test-does-not-exist0");
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("opened a nonexistent interface"),
        }
    }

    #[test]
    fn test_read_mac_missing() {
        assert!(read_mac("sensor-test-does-not-exist0").is_none());
    }
}
