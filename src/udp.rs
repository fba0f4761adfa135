//! UDP session handling
//!
//! A session is created by the first datagram of an unseen 4-tuple and relays
//! datagrams verbatim in both directions. The only state is the activity timestamp
//! used for idle eviction.

use crate::error::{EngineError, Result};
use crate::hooks::SocketProtector;
use crate::nat::{FlowKey, TrackedFlow};
use crate::packet::build_udp_packet;
use bytes::BytesMut;
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// UDP session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// SO_SNDBUF / SO_RCVBUF of the real socket
    pub socket_buffer_size: usize,
    /// Receive buffer for one datagram from the network
    pub max_datagram_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            socket_buffer_size: 64 * 1024,
            max_datagram_size: 32767,
        }
    }
}

fn bind_protected(dst: SocketAddrV4, config: &UdpConfig, protector: &dyn SocketProtector) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    let fd = socket.as_raw_fd();
    if !protector.protect(fd) {
        warn!("Failed to protect UDP socket fd={}, datagrams may loop", fd);
    }

    socket.set_send_buffer_size(config.socket_buffer_size)?;
    socket.set_recv_buffer_size(config.socket_buffer_size)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.connect(&SocketAddr::V4(dst).into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket))
}

/// A UDP flow and its connected socket
pub struct UdpFlow {
    key: FlowKey,
    socket: UdpSocket,
    mtu: usize,
    last_activity: Instant,
    datagrams_out: u64,
    datagrams_in: u64,
}

impl UdpFlow {
    /// Open a socket toward the flow's destination and register it for reads under `token`.
    pub fn open(
        key: FlowKey,
        config: &UdpConfig,
        mtu: usize,
        protector: &dyn SocketProtector,
        registry: &Registry,
        token: Token,
    ) -> Result<Self> {
        let socket = bind_protected(key.dst, config, protector)?;
        let mut flow = Self {
            key,
            socket,
            mtu,
            last_activity: Instant::now(),
            datagrams_out: 0,
            datagrams_in: 0,
        };
        registry.register(&mut flow.socket, token, Interest::READABLE)?;
        debug!("UDP session created: {}", key);
        Ok(flow)
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    /// (datagrams sent to the network, datagrams relayed back)
    pub fn stats(&self) -> (u64, u64) {
        (self.datagrams_out, self.datagrams_in)
    }

    /// Send one datagram from the client to the real destination.
    ///
    /// A full socket buffer drops the datagram, as the network would.
    pub fn forward(&mut self, payload: &[u8]) -> Result<()> {
        self.last_activity = Instant::now();
        match self.socket.send(payload) {
            Ok(_) => {
                self.datagrams_out += 1;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("UDP send buffer full, dropping {} bytes: {}", payload.len(), self.key);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drain received datagrams into packets addressed back to the client.
    ///
    /// `observe` sees each datagram as received.
    pub fn on_readable(&mut self, buf: &mut [u8], mut observe: impl FnMut(&[u8])) -> Result<Vec<BytesMut>> {
        let mut packets = Vec::new();
        loop {
            match self.socket.recv(buf) {
                Ok(n) => {
                    self.last_activity = Instant::now();
                    self.datagrams_in += 1;
                    observe(&buf[..n]);
                    match build_udp_packet(self.key.dst, self.key.src, &buf[..n], self.mtu) {
                        Ok(pkt) => packets.push(pkt),
                        Err(EngineError::PacketTooLarge { size, mtu }) => {
                            warn!("UDP reply of {} bytes exceeds MTU {}, dropped: {}", size, mtu, self.key);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        trace!("UDP received {} datagrams: {}", packets.len(), self.key);
        Ok(packets)
    }

    /// Deregister the socket; it closes when the flow is dropped.
    pub fn close(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.socket) {
            trace!("UDP deregister failed for {}: {}", self.key, e);
        }
    }
}

impl TrackedFlow for UdpFlow {
    fn last_activity(&self) -> Instant {
        self.last_activity
    }
}
