//! Virtual interface abstraction and the interface pump
//!
//! The read loop pulls raw packets off the interface and hands them to a
//! dispatcher; the write loop drains the bounded outbound queue. Both poll the
//! running flag between bounded waits so shutdown never hangs on a blocking read.

use crate::error::{EngineError, Result};
use crate::stats::StackStats;
use bytes::BytesMut;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name (for logging)
    pub name: String,
    /// Interface address
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    /// Routes sent through the interface, `a.b.c.d/n`
    pub routes: Vec<String>,
    /// DNS servers advertised to the OS and used for blocklist lookups
    pub dns_servers: Vec<IpAddr>,
    pub mtu: usize,
    /// Outbound packets held before new ones are dropped
    pub write_queue_capacity: usize,
    pub read_buffer_size: usize,
    /// Longest a read waits before the loop checks for shutdown
    pub read_poll_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "tun0".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 2),
            prefix_len: 32,
            routes: vec!["0.0.0.0/0".to_string()],
            dns_servers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            ],
            mtu: 1500,
            write_queue_capacity: 5000,
            read_buffer_size: 32767,
            read_poll_interval_ms: 10,
        }
    }
}

impl DeviceConfig {
    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_interval_ms)
    }
}

/// Trait for virtual network interfaces
pub trait VirtualInterface: Send + Sync {
    /// Wait up to `timeout` for one packet. `Ok(None)` means nothing arrived.
    fn read_packet(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>>;

    /// Write one packet to the interface
    fn write_packet(&self, data: &[u8]) -> Result<usize>;

    fn mtu(&self) -> usize;

    fn name(&self) -> &str;

    fn is_ready(&self) -> bool;

    /// Release the interface; later reads and writes fail with `DeviceClosed`.
    fn close(&self);
}

/// TUN interface backed by a file descriptor
pub struct FdInterface {
    file: RwLock<Option<File>>,
    config: DeviceConfig,
}

impl FdInterface {
    /// Wrap a duplicate of `fd`. The caller keeps ownership of the original.
    pub fn from_raw_fd(fd: RawFd, config: DeviceConfig) -> Result<Self> {
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let file = unsafe { File::from_raw_fd(dup) };
        info!("Interface {} opened (fd={})", config.name, dup);
        Ok(Self { file: RwLock::new(Some(file)), config })
    }

    fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err.into());
        }
        if rc == 0 {
            return Ok(false);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 && pfd.revents & libc::POLLIN == 0 {
            return Err(EngineError::DeviceClosed);
        }
        Ok(true)
    }
}

impl VirtualInterface for FdInterface {
    fn read_packet(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        let guard = self.file.read();
        let Some(file) = guard.as_ref() else {
            return Err(EngineError::DeviceClosed);
        };
        if !Self::wait_readable(file.as_raw_fd(), timeout)? {
            return Ok(None);
        }
        let mut reader: &File = file;
        match reader.read(buf) {
            Ok(0) => Err(EngineError::DeviceClosed),
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_packet(&self, data: &[u8]) -> Result<usize> {
        let guard = self.file.read();
        let Some(file) = guard.as_ref() else {
            return Err(EngineError::DeviceClosed);
        };
        let mut writer: &File = file;
        Ok(writer.write(data)?)
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_ready(&self) -> bool {
        self.file.read().is_some()
    }

    fn close(&self) {
        if self.file.write().take().is_some() {
            info!("Interface {} closed", self.config.name);
        }
    }
}

/// In-process interface whose peer injects and collects raw packets
pub struct ChannelInterface {
    name: String,
    mtu: usize,
    inbound: Receiver<Vec<u8>>,
    outbound: Sender<Vec<u8>>,
    closed: AtomicBool,
}

/// Host side of a [`ChannelInterface`]
#[derive(Clone)]
pub struct ChannelPeer {
    to_engine: Sender<Vec<u8>>,
    from_engine: Receiver<Vec<u8>>,
}

impl ChannelInterface {
    pub fn pair(name: &str, mtu: usize) -> (Self, ChannelPeer) {
        let (to_engine, inbound) = unbounded();
        let (outbound, from_engine) = unbounded();
        let iface = Self {
            name: name.to_string(),
            mtu,
            inbound,
            outbound,
            closed: AtomicBool::new(false),
        };
        (iface, ChannelPeer { to_engine, from_engine })
    }
}

impl ChannelPeer {
    /// Deliver a packet as if the device sent it.
    pub fn send(&self, packet: impl Into<Vec<u8>>) -> Result<()> {
        self.to_engine.send(packet.into()).map_err(|_| EngineError::ChannelClosed)
    }

    /// Next packet written by the engine, if one arrives in time.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.from_engine.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.from_engine.try_recv().ok()
    }
}

impl VirtualInterface for ChannelInterface {
    fn read_packet(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::DeviceClosed);
        }
        match self.inbound.recv_timeout(timeout) {
            Ok(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(Some(len))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::DeviceClosed),
        }
    }

    fn write_packet(&self, data: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::DeviceClosed);
        }
        self.outbound
            .send(data.to_vec())
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(data.len())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Bounded FIFO of synthesized packets awaiting the write loop
pub struct PacketQueue {
    tx: Sender<BytesMut>,
    rx: Receiver<BytesMut>,
    dropped: AtomicU64,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx, dropped: AtomicU64::new(0) }
    }

    /// Enqueue without blocking. When full the new packet is dropped.
    pub fn offer(&self, packet: BytesMut) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<BytesMut> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Discard everything queued, returning how many packets were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Consumer of packets read from the interface
pub trait PacketHandler {
    fn handle_packet(&mut self, packet: &[u8]);

    /// Runs once per read-loop iteration whether or not a packet arrived.
    fn after_read(&mut self) {}
}

impl<F: FnMut(&[u8])> PacketHandler for F {
    fn handle_packet(&mut self, packet: &[u8]) {
        self(packet)
    }
}

/// Read packets until `running` clears or the interface fails.
pub fn run_read_loop(
    iface: &dyn VirtualInterface,
    buffer_size: usize,
    poll_interval: Duration,
    running: &AtomicBool,
    stats: &StackStats,
    handler: &mut dyn PacketHandler,
) {
    let mut buf = vec![0u8; buffer_size.max(iface.mtu())];
    info!("Read loop started on {}", iface.name());
    while running.load(Ordering::Acquire) {
        match iface.read_packet(&mut buf, poll_interval) {
            Ok(Some(n)) if n > 0 => {
                stats.record_received(n);
                trace!("Read {} bytes from {}", n, iface.name());
                handler.handle_packet(&buf[..n]);
            }
            Ok(_) => {}
            Err(EngineError::DeviceClosed) => {
                debug!("Interface {} closed, read loop exiting", iface.name());
                break;
            }
            Err(e) => {
                error!("Interface read failed: {}", e);
                break;
            }
        }
        handler.after_read();
    }
    info!("Read loop stopped");
}

/// Write queued packets until `running` clears or the interface fails.
pub fn run_write_loop(
    iface: &dyn VirtualInterface,
    queue: &PacketQueue,
    poll_interval: Duration,
    running: &AtomicBool,
    stats: &StackStats,
) {
    info!("Write loop started on {}", iface.name());
    while running.load(Ordering::Acquire) {
        let Some(packet) = queue.recv_timeout(poll_interval) else {
            continue;
        };
        match iface.write_packet(&packet) {
            Ok(_) => stats.record_sent(packet.len()),
            Err(EngineError::DeviceClosed) => {
                debug!("Interface {} closed, write loop exiting", iface.name());
                break;
            }
            Err(e) => {
                stats.record_dropped();
                warn!("Interface write failed ({} bytes): {}", packet.len(), e);
            }
        }
    }
    info!("Write loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_packet_queue_drops_newest_when_full() {
        let queue = PacketQueue::new(2);
        assert!(queue.offer(BytesMut::from(&b"one"[..])));
        assert!(queue.offer(BytesMut::from(&b"two"[..])));
        assert!(!queue.offer(BytesMut::from(&b"three"[..])));
        assert_eq!(queue.dropped(), 1);

        assert_eq!(&queue.recv_timeout(Duration::ZERO).unwrap()[..], b"one");
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_channel_interface_round_trip() {
        let (iface, peer) = ChannelInterface::pair("test0", 1500);
        peer.send(vec![1, 2, 3]).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(iface.read_packet(&mut buf, Duration::from_millis(100)).unwrap(), Some(3));
        assert_eq!(iface.read_packet(&mut buf, Duration::from_millis(1)).unwrap(), None);

        iface.write_packet(&[9, 9]).unwrap();
        assert_eq!(peer.recv_timeout(Duration::from_millis(100)), Some(vec![9, 9]));

        iface.close();
        assert!(matches!(iface.read_packet(&mut buf, Duration::ZERO), Err(EngineError::DeviceClosed)));
        assert!(!iface.is_ready());
    }

    #[test]
    fn test_fd_interface_reads_with_timeout() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) }, 0);
        let host = unsafe { File::from_raw_fd(fds[1]) };
        let iface = FdInterface::from_raw_fd(fds[0], DeviceConfig::default()).unwrap();
        unsafe { libc::close(fds[0]) };

        let mut buf = [0u8; 64];
        assert_eq!(iface.read_packet(&mut buf, Duration::from_millis(10)).unwrap(), None);
        (&host).write_all(&[0x45, 0, 0, 20]).unwrap();
        assert_eq!(iface.read_packet(&mut buf, Duration::from_millis(500)).unwrap(), Some(4));

        iface.write_packet(&[1, 2]).unwrap();
        let mut back = [0u8; 8];
        assert_eq!((&host).read(&mut back).unwrap(), 2);

        iface.close();
        assert!(matches!(iface.write_packet(&[1]), Err(EngineError::DeviceClosed)));
    }

    #[test]
    fn test_loops_stop_on_flag() {
        let (iface, peer) = ChannelInterface::pair("test0", 1500);
        let iface: Arc<dyn VirtualInterface> = Arc::new(iface);
        let queue = Arc::new(PacketQueue::new(8));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(StackStats::new());

        let writer = {
            let (iface, queue, running, stats) = (iface.clone(), queue.clone(), running.clone(), stats.clone());
            thread::spawn(move || run_write_loop(iface.as_ref(), &queue, Duration::from_millis(10), &running, &stats))
        };
        let reader = {
            let (iface, queue, running, stats) = (iface.clone(), queue.clone(), running.clone(), stats.clone());
            thread::spawn(move || {
                run_read_loop(
                    iface.as_ref(),
                    2048,
                    Duration::from_millis(10),
                    &running,
                    &stats,
                    &mut |pkt: &[u8]| {
                        // Echo everything back through the write queue
                        queue.offer(BytesMut::from(pkt));
                    },
                )
            })
        };

        peer.send(vec![7u8; 10]).unwrap();
        assert_eq!(peer.recv_timeout(Duration::from_secs(2)), Some(vec![7u8; 10]));

        running.store(false, Ordering::Release);
        reader.join().unwrap();
        writer.join().unwrap();
        let snap = stats.snapshot();
        assert_eq!((snap.packets_received, snap.packets_sent), (1, 1));
    }
}
