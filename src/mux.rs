//! Socket readiness multiplexer
//!
//! One `mio::Poll` watches every real socket. The read thread calls
//! [`Multiplexer::poll_once`] with a zero timeout after each interface read so
//! socket events and client packets are handled on the same thread.

use crate::device::PacketHandler;
use crate::error::Result;
use crate::stack::Stack;
use mio::{Events, Poll};
use std::io;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

const EVENTS_CAPACITY: usize = 1024;

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    stack: Stack,
}

impl Multiplexer {
    /// `stack` must have been built with a clone of `poll`'s registry.
    pub fn new(poll: Poll, stack: Stack) -> Self {
        Self { poll, events: Events::with_capacity(EVENTS_CAPACITY), stack }
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    /// Wait up to `timeout` for socket readiness and dispatch it, then run the
    /// idle sweep if it is due. Returns the number of events handled.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<usize> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let mut handled = 0;
        for event in self.events.iter() {
            // Errors and hangups surface through the next read or connect check
            let failed = event.is_error();
            let readable = event.is_readable() || event.is_read_closed() || failed;
            let writable = event.is_writable() || event.is_write_closed() || failed;
            trace!("Socket event {:?} r={} w={}", event.token(), readable, writable);
            self.stack.on_socket_event(event.token(), readable, writable);
            handled += 1;
        }

        self.stack.maybe_sweep(Instant::now());
        Ok(handled)
    }
}

impl PacketHandler for Multiplexer {
    fn handle_packet(&mut self, packet: &[u8]) {
        self.stack.handle_packet(packet);
    }

    fn after_read(&mut self) {
        if let Err(e) = self.poll_once(Duration::ZERO) {
            warn!("Socket poll failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::Blocklist;
    use crate::device::PacketQueue;
    use crate::hooks::{CaptureQueue, Hooks};
    use crate::packet::{build_tcp_packet, parse_packet, TcpFlags, TcpInfo, TcpSegmentSpec, TransportInfo, DEFAULT_MTU};
    use crate::stack::{Flows, StackConfig};
    use crate::stats::StackStats;
    use crate::tcp::TcpState;
    use crate::nat::FlowKey;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, SocketAddrV4, TcpListener};
    use std::sync::Arc;

    fn client() -> SocketAddrV4 {
        "10.0.0.2:41000".parse().unwrap()
    }

    fn setup(idle: Duration) -> (Multiplexer, Arc<PacketQueue>) {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        let queue = Arc::new(PacketQueue::new(256));
        let config = StackConfig { idle_timeout: idle, ..StackConfig::default() };
        let stack = Stack::new(
            config,
            Arc::new(Flows::new()),
            Arc::new(Blocklist::new()),
            registry,
            queue.clone(),
            Hooks::new(Arc::new(CaptureQueue::new(64))),
            Arc::new(StackStats::new()),
        );
        (Multiplexer::new(poll, stack), queue)
    }

    fn segment(dst: SocketAddrV4, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
        let spec = TcpSegmentSpec { src: client(), dst, seq, ack, flags, window: 65535, mss: 1460, window_scale: 7 };
        build_tcp_packet(&spec, payload, DEFAULT_MTU).unwrap().to_vec()
    }

    /// Poll until a TCP packet comes out of the queue.
    fn next_tcp(mux: &mut Multiplexer, queue: &PacketQueue) -> (TcpInfo, Vec<u8>) {
        for _ in 0..100 {
            mux.poll_once(Duration::from_millis(20)).unwrap();
            if let Some(pkt) = queue.recv_timeout(Duration::ZERO) {
                let parsed = parse_packet(&pkt).unwrap();
                let payload = parsed.payload(&pkt).to_vec();
                if let TransportInfo::Tcp(t) = parsed.transport {
                    return (t, payload);
                }
            }
        }
        panic!("no TCP packet produced");
    }

    fn listener() -> (TcpListener, SocketAddrV4) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };
        (listener, addr)
    }

    #[test]
    fn test_handshake_and_relay() {
        let (listener, server) = listener();
        let (mut mux, queue) = setup(Duration::from_secs(60));

        mux.handle_packet(&segment(server, 1000, 0, TcpFlags::syn_only(), &[]));
        let (syn_ack, _) = next_tcp(&mut mux, &queue);
        assert!(syn_ack.flags.syn && syn_ack.flags.ack);
        assert_eq!(syn_ack.ack, 1001);
        let server_seq = syn_ack.seq.wrapping_add(1);

        let (mut conn, _) = listener.accept().unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        mux.handle_packet(&segment(server, 1001, server_seq, TcpFlags::ack_only(), &[]));
        let key = FlowKey::new(client(), server);
        let flow = mux.stack().flows().get_tcp(&key).unwrap();
        assert_eq!(flow.lock().state(), TcpState::Established);

        mux.handle_packet(&segment(server, 1001, server_seq, TcpFlags::psh_ack(), b"hello"));
        let (ack, _) = next_tcp(&mut mux, &queue);
        assert_eq!(ack.ack, 1006);

        for _ in 0..20 {
            mux.poll_once(Duration::from_millis(10)).unwrap();
        }
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        conn.write_all(b"world").unwrap();
        let (data, payload) = next_tcp(&mut mux, &queue);
        assert_eq!(data.seq, server_seq);
        assert_eq!(payload, b"world");
    }

    #[test]
    fn test_refused_connect_sends_rst() {
        let (listener, server) = listener();
        drop(listener);
        let (mut mux, queue) = setup(Duration::from_secs(60));

        mux.handle_packet(&segment(server, 5000, 0, TcpFlags::syn_only(), &[]));
        let (rst, _) = next_tcp(&mut mux, &queue);
        assert!(rst.flags.rst);
        assert_eq!(rst.ack, 5001);

        for _ in 0..5 {
            mux.poll_once(Duration::from_millis(10)).unwrap();
        }
        assert!(mux.stack().flows().is_empty());
    }

    #[test]
    fn test_idle_flow_evicted() {
        let (listener, server) = listener();
        let (mut mux, queue) = setup(Duration::from_millis(100));

        mux.handle_packet(&segment(server, 1000, 0, TcpFlags::syn_only(), &[]));
        next_tcp(&mut mux, &queue);
        let (mut conn, _) = listener.accept().unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        mux.poll_once(Duration::ZERO).unwrap();
        assert!(mux.stack().flows().is_empty());
        assert_eq!(mux.stack().stats().snapshot().flows_evicted_idle, 1);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
    }
}
