//! TCP flow handling
//!
//! Each flow is a NAT endpoint: toward the interface it plays the server, toward
//! the network it is an ordinary client socket. There are no retransmission
//! timers; a segment lost here is recovered by the client's own retransmission.
//!
//! Two receive cursors are kept. `remote_seq` is the next byte expected from the
//! client and is what we acknowledge. `forward_seq` is the next byte to write to
//! the real socket. Bytes in `[forward_seq, remote_seq)` always sit contiguously
//! at the head of the pending queue, and the queue is only ever popped at
//! `forward_seq`, so the server sees client bytes strictly in sequence order.

use crate::error::{EngineError, Result};
use crate::hooks::SocketProtector;
use crate::nat::{FlowKey, TrackedFlow};
use crate::packet::{
    build_tcp_packet, build_tcp_rst, TcpFlags, TcpInfo, TcpSegmentSpec, IPV4_HEADER_LEN,
    TCP_HEADER_LEN,
};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Largest shift allowed by RFC 7323
const MAX_WINDOW_SCALE: u8 = 14;

/// TCP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// MSS assumed when the client's SYN carries none
    pub default_mss: u16,
    /// Receive window in bytes, before scaling
    pub recv_window: u32,
    /// Shift offered to clients that support window scaling
    pub recv_window_scale: u8,
    /// Bound on unforwarded client bytes per flow
    pub max_pending_bytes: usize,
    /// SO_SNDBUF / SO_RCVBUF of the real socket
    pub socket_buffer_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            default_mss: 1460,
            recv_window: 65535,
            recv_window_scale: 7,
            max_pending_bytes: 512 * 1024,
            socket_buffer_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Idle,
    SynSent,
    SynReceived,
    Established,
    FinWait,
    CloseWait,
    Closed,
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Check if seq1 is before seq2 (handling wraparound)
pub fn seq_before(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// Check if seq1 is after seq2 (handling wraparound)
pub fn seq_after(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}

pub fn seq_before_or_eq(seq1: u32, seq2: u32) -> bool {
    seq1 == seq2 || seq_before(seq1, seq2)
}

/// Client bytes waiting to be written to the real socket
#[derive(Debug, Clone)]
pub struct Segment {
    pub seq: u32,
    pub data: Bytes,
    pub psh: bool,
    /// Bytes of `data` already written
    pub sent: usize,
}

impl Segment {
    pub fn new(seq: u32, data: &[u8], psh: bool) -> Self {
        Self { seq, data: Bytes::copy_from_slice(data), psh, sent: 0 }
    }

    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }

    /// Sequence number of the first unwritten byte
    pub fn next_seq(&self) -> u32 {
        self.seq.wrapping_add(self.sent as u32)
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.sent..]
    }
}

/// Pending segments sorted by sequence number
#[derive(Debug, Default)]
pub struct SegmentQueue {
    segments: VecDeque<Segment>,
    bytes: usize,
}

impl SegmentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert before the first segment whose sequence number exceeds the new one.
    /// A segment starting at an already-queued sequence number is a duplicate and is refused.
    pub fn insert(&mut self, segment: Segment) -> bool {
        let mut pos = self.segments.len();
        for (i, queued) in self.segments.iter().enumerate() {
            if queued.seq == segment.seq {
                return false;
            }
            if seq_after(queued.seq, segment.seq) {
                pos = i;
                break;
            }
        }
        self.bytes += segment.remaining().len();
        self.segments.insert(pos, segment);
        true
    }

    /// End of the run of queued bytes contiguous with `from`.
    pub fn contiguous_end(&self, from: u32) -> u32 {
        let mut cur = from;
        for seg in &self.segments {
            if seq_after(seg.seq, cur) {
                break;
            }
            if seq_after(seg.end(), cur) {
                cur = seg.end();
            }
        }
        cur
    }

    pub fn front(&self) -> Option<&Segment> {
        self.segments.front()
    }

    /// Unwritten bytes across all segments
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn advance_front(&mut self, n: usize) {
        if let Some(head) = self.segments.front_mut() {
            let n = n.min(head.remaining().len());
            head.sent += n;
            self.bytes -= n;
            if head.remaining().is_empty() {
                self.segments.pop_front();
            }
        }
    }
}

/// Work a flow asks its owner to carry out
#[derive(Debug, PartialEq, Eq)]
pub enum TcpAction {
    /// Deliver a synthesized packet to the interface
    Send(BytesMut),
    /// Arm write readiness on the real socket
    EnableWrite,
    /// Stop reading from the real socket; the next read reports end-of-stream
    ShutdownRead,
    /// Evict the flow
    Close,
}

/// Result of draining pending bytes into the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// In-order bytes remain; keep write readiness armed
    Pending,
    /// Nothing left to write until more client data arrives
    Drained { shutdown_read: bool },
}

/// Per-flow TCP automaton, independent of any socket
pub struct TcpControl {
    key: FlowKey,
    state: TcpState,
    local_seq: u32,
    remote_seq: u32,
    forward_seq: u32,
    /// The client's initial sequence number
    irs: u32,
    /// Highest of our sequence numbers the client has acknowledged
    last_ack: u32,
    send_window: u32,
    recv_window: u32,
    mss: u16,
    send_scale: u8,
    recv_scale: u8,
    pending: SegmentQueue,
    max_pending: usize,
    mtu: usize,
    /// Sequence number of the client's FIN, once in order
    fin_seq: Option<u32>,
    shutdown_after_drain: bool,
    last_activity: Instant,
    bytes_forwarded: u64,
    bytes_relayed: u64,
}

impl TcpControl {
    pub fn new(key: FlowKey, syn: &TcpInfo, config: &TcpConfig, mtu: usize) -> Self {
        Self::with_iss(key, syn, config, mtu, rand::random())
    }

    /// Create with a chosen initial send sequence.
    pub fn with_iss(key: FlowKey, syn: &TcpInfo, config: &TcpConfig, mtu: usize, iss: u32) -> Self {
        let mss_cap = mtu
            .saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN)
            .min(u16::MAX as usize) as u16;
        let mss = syn.mss.unwrap_or(config.default_mss).min(mss_cap).max(1);

        // Scaling applies only when both sides offer it
        let (send_scale, recv_scale) = match syn.window_scale {
            Some(ws) => (ws.min(MAX_WINDOW_SCALE), config.recv_window_scale.min(MAX_WINDOW_SCALE)),
            None => (0, 0),
        };

        let remote_seq = syn.seq.wrapping_add(1);
        Self {
            key,
            state: TcpState::Idle,
            local_seq: iss,
            remote_seq,
            forward_seq: remote_seq,
            irs: syn.seq,
            last_ack: iss,
            send_window: syn.window as u32,
            recv_window: config.recv_window,
            mss,
            send_scale,
            recv_scale,
            pending: SegmentQueue::new(),
            max_pending: config.max_pending_bytes,
            mtu,
            fin_seq: None,
            shutdown_after_drain: false,
            last_activity: Instant::now(),
            bytes_forwarded: 0,
            bytes_relayed: 0,
        }
    }

    pub fn key(&self) -> FlowKey { self.key }
    pub fn state(&self) -> TcpState { self.state }
    pub fn local_seq(&self) -> u32 { self.local_seq }
    pub fn remote_seq(&self) -> u32 { self.remote_seq }
    pub fn forward_seq(&self) -> u32 { self.forward_seq }
    pub fn last_ack(&self) -> u32 { self.last_ack }
    pub fn mss(&self) -> u16 { self.mss }
    pub fn send_scale(&self) -> u8 { self.send_scale }
    pub fn recv_scale(&self) -> u8 { self.recv_scale }
    pub fn send_window(&self) -> u32 { self.send_window }
    pub fn pending(&self) -> &SegmentQueue { &self.pending }
    pub fn last_activity(&self) -> Instant { self.last_activity }

    /// (bytes written to the server, bytes relayed to the client)
    pub fn stats(&self) -> (u64, u64) {
        (self.bytes_forwarded, self.bytes_relayed)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// A SYN from the same endpoints with a different initial sequence number
    /// belongs to a new connection reusing the client port.
    pub fn is_new_connection(&self, syn: &TcpInfo) -> bool {
        syn.flags.syn && !syn.flags.ack && syn.seq != self.irs
    }

    /// The real socket is connecting.
    pub fn connecting(&mut self) {
        if self.state == TcpState::Idle {
            self.state = TcpState::SynSent;
        }
    }

    fn advertised_window(&self) -> u16 {
        (self.recv_window >> self.recv_scale).min(u16::MAX as u32) as u16
    }

    fn segment(&self, flags: TcpFlags, seq: u32) -> TcpSegmentSpec {
        TcpSegmentSpec {
            src: self.key.dst,
            dst: self.key.src,
            seq,
            ack: self.remote_seq,
            flags,
            window: self.advertised_window(),
            mss: self.mss,
            window_scale: self.recv_scale,
        }
    }

    fn build(&self, flags: TcpFlags, seq: u32, payload: &[u8]) -> Result<BytesMut> {
        build_tcp_packet(&self.segment(flags, seq), payload, self.mtu)
    }

    fn syn_ack(&self, seq: u32) -> Result<BytesMut> {
        let mut spec = self.segment(TcpFlags::syn_ack(), seq);
        // Windows in SYN segments are never scaled
        spec.window = self.recv_window.min(u16::MAX as u32) as u16;
        build_tcp_packet(&spec, &[], self.mtu)
    }

    /// Bare ACK carrying the current `remote_seq`.
    pub fn ack_packet(&self) -> Result<BytesMut> {
        self.build(TcpFlags::ack_only(), self.local_seq, &[])
    }

    /// The real socket connected: answer the client's SYN.
    pub fn on_connected(&mut self) -> Result<BytesMut> {
        let pkt = self.syn_ack(self.local_seq)?;
        self.local_seq = self.local_seq.wrapping_add(1);
        self.state = TcpState::SynReceived;
        self.touch();
        debug!("TCP SYN_RECEIVED: {} mss={} wscale={}/{}", self.key, self.mss, self.send_scale, self.recv_scale);
        Ok(pkt)
    }

    /// The real socket failed to connect: refuse the client.
    pub fn on_connect_failed(&mut self) -> BytesMut {
        self.state = TcpState::Closed;
        build_tcp_rst(self.key.dst, self.key.src, self.local_seq, self.remote_seq)
    }

    fn accepts_data(&self) -> bool {
        matches!(
            self.state,
            TcpState::SynReceived | TcpState::Established | TcpState::FinWait | TcpState::CloseWait
        )
    }

    fn forwards_data(&self) -> bool {
        matches!(self.state, TcpState::Established | TcpState::FinWait | TcpState::CloseWait)
    }

    /// Whether server bytes may still be relayed to the client
    pub fn can_relay(&self) -> bool {
        matches!(self.state, TcpState::SynReceived | TcpState::Established | TcpState::CloseWait)
    }

    /// Process a segment from the client.
    pub fn process(&mut self, seg: &TcpInfo, payload: &[u8]) -> Result<Vec<TcpAction>> {
        self.touch();
        let mut actions = Vec::new();

        if seg.flags.rst {
            debug!("TCP RST from client: {}", self.key);
            self.state = TcpState::Closed;
            actions.push(TcpAction::Close);
            return Ok(actions);
        }

        if seg.flags.syn {
            // Retransmitted SYN; repeat our answer if we already gave one
            if self.state == TcpState::SynReceived {
                actions.push(TcpAction::Send(self.syn_ack(self.local_seq.wrapping_sub(1))?));
            }
            return Ok(actions);
        }

        if !self.accepts_data() {
            return Ok(actions);
        }

        if seg.flags.ack && self.on_ack(seg, &mut actions) {
            self.state = TcpState::Closed;
            debug!("TCP FIN acknowledged -> CLOSED: {}", self.key);
            actions.push(TcpAction::Close);
            return Ok(actions);
        }

        let mut need_ack = false;
        if !payload.is_empty() {
            self.on_data(seg.seq, payload, seg.flags.psh, &mut actions);
            need_ack = true;
        }

        let mut close = false;
        if seg.flags.fin {
            need_ack = true;
            let fin_seq = seg.seq.wrapping_add(payload.len() as u32);
            if fin_seq == self.remote_seq {
                close = self.on_fin(fin_seq, &mut actions);
            } else {
                trace!("FIN out of order: seq={} expected={}", fin_seq, self.remote_seq);
            }
        }

        if need_ack {
            actions.push(TcpAction::Send(self.ack_packet()?));
        }
        if close {
            actions.push(TcpAction::Close);
        }
        Ok(actions)
    }

    /// Returns true when the ACK completes a client-initiated close.
    fn on_ack(&mut self, seg: &TcpInfo, actions: &mut Vec<TcpAction>) -> bool {
        if self.state == TcpState::SynReceived && seg.ack == self.local_seq {
            self.state = TcpState::Established;
            debug!("TCP ESTABLISHED: {}", self.key);
            if !self.pending.is_empty() {
                actions.push(TcpAction::EnableWrite);
            }
        }
        if seq_after(seg.ack, self.last_ack) && seq_before_or_eq(seg.ack, self.local_seq) {
            self.last_ack = seg.ack;
        }
        self.send_window = (seg.window as u32) << self.send_scale;
        self.state == TcpState::FinWait && self.fin_seq.is_some() && seg.ack == self.local_seq
    }

    fn on_data(&mut self, seq: u32, payload: &[u8], psh: bool, actions: &mut Vec<TcpAction>) {
        if seq_before(seq, self.remote_seq) {
            trace!("Duplicate segment: seq={} len={} expected={}", seq, payload.len(), self.remote_seq);
            return;
        }
        if self.pending.bytes() + payload.len() > self.max_pending {
            warn!(
                "Pending queue full ({} bytes), dropping segment: seq={} len={} {}",
                self.pending.bytes(), seq, payload.len(), self.key
            );
            return;
        }

        if seq == self.remote_seq {
            self.pending.insert(Segment::new(seq, payload, psh));
            self.remote_seq = self.pending.contiguous_end(seq);
            if self.forwards_data() {
                actions.push(TcpAction::EnableWrite);
            }
        } else if self.pending.insert(Segment::new(seq, payload, psh)) {
            debug!(
                "Buffering out-of-order segment: seq={} len={} expected={} {}",
                seq, payload.len(), self.remote_seq, self.key
            );
        }
    }

    /// Returns true when the flow is finished.
    fn on_fin(&mut self, fin_seq: u32, actions: &mut Vec<TcpAction>) -> bool {
        match self.state {
            TcpState::SynReceived | TcpState::Established => {
                self.remote_seq = self.remote_seq.wrapping_add(1);
                self.fin_seq = Some(fin_seq);
                self.state = TcpState::CloseWait;
                debug!("TCP FIN recv -> CLOSE_WAIT: {}", self.key);
                if self.forward_seq == fin_seq {
                    actions.push(TcpAction::ShutdownRead);
                } else {
                    self.shutdown_after_drain = true;
                }
                false
            }
            TcpState::FinWait => {
                self.remote_seq = self.remote_seq.wrapping_add(1);
                self.fin_seq = Some(fin_seq);
                self.state = TcpState::Closed;
                debug!("TCP FIN recv in FIN_WAIT -> CLOSED: {}", self.key);
                true
            }
            _ => false,
        }
    }

    /// Write in-order pending bytes to `w` until it would block.
    ///
    /// A partial write records progress on the head segment and stops, so the
    /// next call resumes exactly where this one left off.
    pub fn flush<W: Write>(&mut self, w: &mut W) -> Result<FlushStatus> {
        if !self.forwards_data() {
            return Ok(FlushStatus::Pending);
        }

        loop {
            let Some(head) = self.pending.front() else { break };
            let start = head.next_seq();
            if start != self.forward_seq {
                if seq_before(start, self.forward_seq) {
                    // Overlaps bytes already written
                    let skip = self.forward_seq.wrapping_sub(start) as usize;
                    self.pending.advance_front(skip);
                    continue;
                }
                break;
            }

            match w.write(head.remaining()) {
                Ok(0) => return Err(EngineError::Io(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => {
                    let whole = n == head.remaining().len();
                    self.pending.advance_front(n);
                    self.forward_seq = self.forward_seq.wrapping_add(n as u32);
                    self.bytes_forwarded += n as u64;
                    if !whole {
                        trace!("Partial write {} bytes, {} left {}", n, self.pending.bytes(), self.key);
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let data_end = self.fin_seq.unwrap_or(self.remote_seq);
        if self.forward_seq != data_end {
            return Ok(FlushStatus::Pending);
        }
        let shutdown_read = std::mem::take(&mut self.shutdown_after_drain);
        Ok(FlushStatus::Drained { shutdown_read })
    }

    /// Turn bytes read from the server into MSS-sized packets; PSH marks the last one.
    pub fn packetize(&mut self, data: &[u8]) -> Result<Vec<BytesMut>> {
        let count = data.len().div_ceil(self.mss as usize);
        let mut packets = Vec::with_capacity(count);
        for (i, chunk) in data.chunks(self.mss as usize).enumerate() {
            let flags = if i + 1 == count { TcpFlags::psh_ack() } else { TcpFlags::ack_only() };
            packets.push(self.build(flags, self.local_seq, chunk)?);
            self.local_seq = self.local_seq.wrapping_add(chunk.len() as u32);
        }
        self.bytes_relayed += data.len() as u64;
        self.touch();
        Ok(packets)
    }

    /// The read side of the real socket reached end-of-stream, either because
    /// the server closed or because a client FIN shut the read half.
    pub fn on_server_eof(&mut self) -> Result<Vec<TcpAction>> {
        let mut actions = Vec::new();
        match self.state {
            TcpState::SynReceived | TcpState::Established | TcpState::CloseWait => {
                actions.push(TcpAction::Send(self.build(TcpFlags::fin_ack(), self.local_seq, &[])?));
                self.local_seq = self.local_seq.wrapping_add(1);
                debug!("TCP read EOF in {:?} -> FIN_WAIT: {}", self.state, self.key);
                self.state = TcpState::FinWait;
            }
            _ => {
                self.state = TcpState::Closed;
                actions.push(TcpAction::Close);
            }
        }
        Ok(actions)
    }
}

/// Open a protected, non-blocking socket toward `dst`; the connect completes asynchronously.
fn connect_protected(dst: SocketAddrV4, config: &TcpConfig, protector: &dyn SocketProtector) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;

    let fd = socket.as_raw_fd();
    if !protector.protect(fd) {
        warn!("Failed to protect socket fd={}, connection may cause routing loop", fd);
    }

    socket.set_nodelay(true)?;
    socket.set_send_buffer_size(config.socket_buffer_size)?;
    socket.set_recv_buffer_size(config.socket_buffer_size)?;
    socket.set_nonblocking(true)?;

    match socket.connect(&SocketAddr::V4(dst).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpStream::from_std(std_stream))
}

/// A TCP flow and the real socket it forwards to
pub struct TcpFlow {
    control: TcpControl,
    stream: TcpStream,
    token: Token,
    write_interest: bool,
}

impl TcpFlow {
    /// Start connecting to the flow's destination and register the socket under `token`.
    pub fn open(
        control: TcpControl,
        config: &TcpConfig,
        protector: &dyn SocketProtector,
        registry: &Registry,
        token: Token,
    ) -> Result<Self> {
        let stream = connect_protected(control.key().dst, config, protector)?;
        let mut flow = Self { control, stream, token, write_interest: true };
        registry.register(&mut flow.stream, token, Interest::READABLE | Interest::WRITABLE)?;
        flow.control.connecting();
        trace!("TCP connecting: {}", flow.control.key());
        Ok(flow)
    }

    pub fn control(&self) -> &TcpControl {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut TcpControl {
        &mut self.control
    }

    pub fn state(&self) -> TcpState {
        self.control.state()
    }

    /// Check a pending connect. `Ok(None)` means it is still in progress.
    pub fn finish_connect(&mut self, registry: &Registry) -> Result<Option<BytesMut>> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e.into());
        }
        match self.stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(None),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.set_write_interest(registry, false)?;
        self.control.on_connected().map(Some)
    }

    /// Re-register for the given readiness. Re-registering also re-arms edge-triggered events.
    pub fn set_write_interest(&mut self, registry: &Registry, enabled: bool) -> Result<()> {
        let interest = if enabled { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        registry.reregister(&mut self.stream, self.token, interest)?;
        self.write_interest = enabled;
        Ok(())
    }

    /// Drain everything the server has sent into packets for the client.
    ///
    /// `observe` sees each chunk read from the socket.
    pub fn on_readable(&mut self, buf: &mut [u8], mut observe: impl FnMut(&[u8])) -> Result<Vec<TcpAction>> {
        let mut actions = Vec::new();
        while self.control.can_relay() {
            match self.stream.read(buf) {
                Ok(0) => {
                    actions.extend(self.control.on_server_eof()?);
                    break;
                }
                Ok(n) => {
                    observe(&buf[..n]);
                    for pkt in self.control.packetize(&buf[..n])? {
                        actions.push(TcpAction::Send(pkt));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(actions)
    }

    /// Forward pending client bytes; drops write interest once drained.
    pub fn on_writable(&mut self, registry: &Registry) -> Result<Vec<TcpAction>> {
        match self.control.flush(&mut self.stream)? {
            FlushStatus::Pending => Ok(Vec::new()),
            FlushStatus::Drained { shutdown_read } => {
                if self.write_interest {
                    self.set_write_interest(registry, false)?;
                }
                Ok(if shutdown_read { vec![TcpAction::ShutdownRead] } else { Vec::new() })
            }
        }
    }

    /// Shut the read half of the real socket and drain it. Buffered server
    /// bytes are still relayed before the end-of-stream turns into a FIN.
    pub fn shutdown_read(&mut self, buf: &mut [u8], observe: impl FnMut(&[u8])) -> Result<Vec<TcpAction>> {
        if let Err(e) = self.stream.shutdown(Shutdown::Read) {
            debug!("TCP shutdown(read) failed for {}: {}", self.control.key(), e);
        }
        self.on_readable(buf, observe)
    }

    /// Deregister and close the real socket.
    pub fn close(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.stream) {
            trace!("TCP deregister failed for {}: {}", self.control.key(), e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.control.state = TcpState::Closed;
    }
}

impl TrackedFlow for TcpFlow {
    fn last_activity(&self) -> Instant {
        self.control.last_activity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{parse_packet, TransportInfo, DEFAULT_MTU};

    fn key() -> FlowKey {
        FlowKey::new("10.0.0.2:40000".parse().unwrap(), "93.184.216.34:80".parse().unwrap())
    }

    fn info(seq: u32, ack: u32, flags: TcpFlags, payload_len: usize) -> TcpInfo {
        TcpInfo {
            src_port: 40000,
            dst_port: 80,
            seq,
            ack,
            header_len: 20,
            flags,
            window: 1024,
            mss: None,
            window_scale: None,
            payload_offset: 40,
            payload_len,
        }
    }

    fn syn(seq: u32, mss: Option<u16>, ws: Option<u8>) -> TcpInfo {
        let mut s = info(seq, 0, TcpFlags::syn_only(), 0);
        s.window = 64240;
        s.mss = mss;
        s.window_scale = ws;
        s
    }

    fn tcp_of(pkt: &[u8]) -> TcpInfo {
        match parse_packet(pkt).unwrap().transport {
            TransportInfo::Tcp(t) => t,
            other => panic!("expected tcp, got {:?}", other),
        }
    }

    fn sent(actions: &[TcpAction]) -> Vec<TcpInfo> {
        actions
            .iter()
            .filter_map(|a| match a {
                TcpAction::Send(p) => Some(tcp_of(p)),
                _ => None,
            })
            .collect()
    }

    /// Control in ESTABLISHED with `remote_seq == client_next` and `local_seq == 5001`.
    fn established(client_next: u32, config: &TcpConfig) -> TcpControl {
        let mut c = TcpControl::with_iss(key(), &syn(client_next.wrapping_sub(1), None, None), config, DEFAULT_MTU, 5000);
        c.connecting();
        c.on_connected().unwrap();
        c.process(&info(client_next, 5001, TcpFlags::ack_only(), 0), &[]).unwrap();
        assert_eq!(c.state(), TcpState::Established);
        c
    }

    /// Accepts a few bytes per call and reports WouldBlock on every other call.
    struct Trickle {
        out: Vec<u8>,
        per_call: usize,
        block_next: bool,
    }

    impl Trickle {
        fn new(per_call: usize) -> Self {
            Self { out: Vec::new(), per_call, block_next: false }
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let blocked = self.block_next;
            self.block_next = !blocked;
            if blocked {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.per_call);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn flush_all(c: &mut TcpControl, w: &mut Trickle) -> FlushStatus {
        for _ in 0..1000 {
            if let FlushStatus::Drained { shutdown_read } = c.flush(w).unwrap() {
                return FlushStatus::Drained { shutdown_read };
            }
        }
        FlushStatus::Pending
    }

    #[test]
    fn test_handshake() {
        let config = TcpConfig::default();
        let mut c = TcpControl::with_iss(key(), &syn(1000, Some(1400), Some(8)), &config, DEFAULT_MTU, 77);
        assert_eq!(c.state(), TcpState::Idle);
        c.connecting();
        assert_eq!(c.state(), TcpState::SynSent);

        let syn_ack = tcp_of(&c.on_connected().unwrap());
        assert!(syn_ack.flags.syn && syn_ack.flags.ack);
        assert_eq!(syn_ack.seq, 77);
        assert_eq!(syn_ack.ack, 1001);
        assert_eq!(syn_ack.mss, Some(1400));
        assert_eq!(syn_ack.window_scale, Some(7));
        assert_eq!(syn_ack.window, 65535);
        assert_eq!(c.state(), TcpState::SynReceived);

        // An ACK for anything but S+1 does not establish
        c.process(&info(1001, 77, TcpFlags::ack_only(), 0), &[]).unwrap();
        assert_eq!(c.state(), TcpState::SynReceived);
        c.process(&info(1001, 78, TcpFlags::ack_only(), 0), &[]).unwrap();
        assert_eq!(c.state(), TcpState::Established);
        assert_eq!(c.last_ack(), 78);
    }

    #[test]
    fn test_mss_capped_by_mtu() {
        let config = TcpConfig::default();
        let c = TcpControl::with_iss(key(), &syn(1, Some(9000), None), &config, 576, 1);
        assert_eq!(c.mss(), 536);
        let c = TcpControl::with_iss(key(), &syn(1, None, None), &config, DEFAULT_MTU, 1);
        assert_eq!(c.mss(), 1460);
    }

    #[test]
    fn test_window_scaling_negotiation() {
        let config = TcpConfig::default();
        let mut c = established(1001, &config);
        assert_eq!((c.send_scale(), c.recv_scale()), (0, 0));
        let ack = sent(&c.process(&info(1001, 5001, TcpFlags::psh_ack(), 1), b"x").unwrap());
        assert_eq!(ack[0].window, 65535);

        let mut c = TcpControl::with_iss(key(), &syn(1000, None, Some(6)), &config, DEFAULT_MTU, 5000);
        c.connecting();
        c.on_connected().unwrap();
        let mut seg = info(1001, 5001, TcpFlags::ack_only(), 0);
        seg.window = 100;
        let acts = c.process(&seg, &[]).unwrap();
        assert!(acts.is_empty());
        assert_eq!(c.send_window(), 100 << 6);
        let ack = tcp_of(&c.ack_packet().unwrap());
        assert_eq!(ack.window, (65535u32 >> 7) as u16);
    }

    #[test]
    fn test_out_of_order_forwarded_in_sequence() {
        let mut c = established(1900, &TcpConfig::default());
        let first = vec![b'a'; 100];
        let second = vec![b'b'; 100];

        let acts = c.process(&info(2000, 5001, TcpFlags::psh_ack(), 100), &second).unwrap();
        assert!(!acts.contains(&TcpAction::EnableWrite));
        assert_eq!(sent(&acts)[0].ack, 1900);
        assert_eq!(c.remote_seq(), 1900);

        let mut w = Trickle::new(30);
        assert_eq!(c.flush(&mut w).unwrap(), FlushStatus::Drained { shutdown_read: false });
        assert!(w.out.is_empty());

        let acts = c.process(&info(1900, 5001, TcpFlags::psh_ack(), 100), &first).unwrap();
        assert!(acts.contains(&TcpAction::EnableWrite));
        assert_eq!(sent(&acts)[0].ack, 2100);
        assert_eq!(c.remote_seq(), 2100);

        assert_eq!(flush_all(&mut c, &mut w), FlushStatus::Drained { shutdown_read: false });
        let mut expected = first.clone();
        expected.extend_from_slice(&second);
        assert_eq!(w.out, expected);
        assert_eq!(c.forward_seq(), 2100);
        assert!(c.pending().is_empty());
    }

    #[test]
    fn test_duplicate_segment_only_acks() {
        let mut c = established(1001, &TcpConfig::default());
        c.process(&info(1001, 5001, TcpFlags::psh_ack(), 5), b"hello").unwrap();
        let mut w = Trickle::new(1000);
        flush_all(&mut c, &mut w);
        assert_eq!(w.out, b"hello");

        let acts = c.process(&info(1001, 5001, TcpFlags::psh_ack(), 5), b"hello").unwrap();
        let acks = sent(&acts);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].ack, 1006);
        assert!(!acts.contains(&TcpAction::EnableWrite));
        assert_eq!(c.remote_seq(), 1006);
        assert!(c.pending().is_empty());
        flush_all(&mut c, &mut w);
        assert_eq!(w.out, b"hello");
    }

    #[test]
    fn test_pending_bound_drops_excess() {
        let config = TcpConfig { max_pending_bytes: 150, ..Default::default() };
        let mut c = established(1000, &config);
        c.process(&info(1100, 5001, TcpFlags::ack_only(), 100), &[1; 100]).unwrap();
        c.process(&info(1200, 5001, TcpFlags::ack_only(), 100), &[2; 100]).unwrap();
        assert_eq!(c.pending().len(), 1);
        assert_eq!(c.pending().bytes(), 100);
    }

    #[test]
    fn test_data_before_established_waits() {
        let mut c = TcpControl::with_iss(key(), &syn(999, None, None), &TcpConfig::default(), DEFAULT_MTU, 5000);
        c.connecting();
        c.on_connected().unwrap();

        // ACK number wrong, data still accepted and acknowledged
        let acts = c.process(&info(1000, 4000, TcpFlags::psh_ack(), 3), b"abc").unwrap();
        assert!(!acts.contains(&TcpAction::EnableWrite));
        assert_eq!(c.remote_seq(), 1003);
        let mut w = Trickle::new(100);
        assert_eq!(c.flush(&mut w).unwrap(), FlushStatus::Pending);
        assert!(w.out.is_empty());

        let acts = c.process(&info(1003, 5001, TcpFlags::ack_only(), 0), &[]).unwrap();
        assert_eq!(acts, vec![TcpAction::EnableWrite]);
        flush_all(&mut c, &mut w);
        assert_eq!(w.out, b"abc");
    }

    #[test]
    fn test_client_fin_then_read_eof() {
        let mut c = established(1001, &TcpConfig::default());
        let acts = c.process(&info(1001, 5001, TcpFlags::fin_ack(), 0), &[]).unwrap();
        assert_eq!(c.state(), TcpState::CloseWait);
        assert_eq!(c.remote_seq(), 1002);
        assert!(acts.contains(&TcpAction::ShutdownRead));
        assert_eq!(sent(&acts)[0].ack, 1002);

        // Server bytes are still relayed until the read half reports EOF
        assert!(c.can_relay());
        let acts = c.on_server_eof().unwrap();
        let fin = &sent(&acts)[0];
        assert!(fin.flags.fin && fin.flags.ack);
        assert_eq!((fin.seq, fin.ack), (5001, 1002));
        assert!(!acts.contains(&TcpAction::Close));
        assert_eq!(c.state(), TcpState::FinWait);

        // A stale ACK keeps the flow, the ACK of our FIN closes it
        assert!(c.process(&info(1002, 5001, TcpFlags::ack_only(), 0), &[]).unwrap().is_empty());
        assert_eq!(c.state(), TcpState::FinWait);
        let acts = c.process(&info(1002, 5002, TcpFlags::ack_only(), 0), &[]).unwrap();
        assert_eq!(acts, vec![TcpAction::Close]);
        assert_eq!(c.state(), TcpState::Closed);
    }

    #[test]
    fn test_client_fin_waits_for_pending_data() {
        let mut c = established(1001, &TcpConfig::default());
        let acts = c.process(&info(1001, 5001, TcpFlags { fin: true, psh: true, ack: true, ..Default::default() }, 4), b"bye!").unwrap();
        assert!(!acts.contains(&TcpAction::ShutdownRead));
        assert_eq!(c.remote_seq(), 1006);
        assert_eq!(sent(&acts).len(), 1);

        let mut w = Trickle::new(2);
        assert_eq!(flush_all(&mut c, &mut w), FlushStatus::Drained { shutdown_read: true });
        assert_eq!(w.out, b"bye!");
        assert_eq!(c.flush(&mut w).unwrap(), FlushStatus::Drained { shutdown_read: false });
    }

    #[test]
    fn test_server_eof_then_client_fin() {
        let mut c = established(1001, &TcpConfig::default());
        let acts = c.on_server_eof().unwrap();
        assert_eq!(c.state(), TcpState::FinWait);
        assert_eq!(sent(&acts)[0].seq, 5001);
        assert_eq!(c.local_seq(), 5002);

        // Without a client FIN the ACK of our FIN does not close
        assert!(c.process(&info(1001, 5002, TcpFlags::ack_only(), 0), &[]).unwrap().is_empty());
        assert_eq!(c.state(), TcpState::FinWait);

        let acts = c.process(&info(1001, 5002, TcpFlags::fin_ack(), 0), &[]).unwrap();
        assert_eq!(sent(&acts)[0].ack, 1002);
        assert_eq!(acts.last(), Some(&TcpAction::Close));
        assert_eq!(c.state(), TcpState::Closed);
    }

    #[test]
    fn test_out_of_order_fin_ignored() {
        let mut c = established(1001, &TcpConfig::default());
        c.process(&info(1010, 5001, TcpFlags::fin_ack(), 0), &[]).unwrap();
        assert_eq!(c.state(), TcpState::Established);
        assert_eq!(c.remote_seq(), 1001);
    }

    #[test]
    fn test_new_isn_is_new_connection() {
        let c = established(1001, &TcpConfig::default());
        assert!(!c.is_new_connection(&syn(1000, None, None)));
        assert!(c.is_new_connection(&syn(90_000, None, None)));
        assert!(!c.is_new_connection(&info(90_000, 5001, TcpFlags::syn_ack(), 0)));
    }

    #[test]
    fn test_rst_closes() {
        let mut c = established(1001, &TcpConfig::default());
        let acts = c.process(&info(1001, 0, TcpFlags { rst: true, ..Default::default() }, 0), &[]).unwrap();
        assert_eq!(acts, vec![TcpAction::Close]);
        assert_eq!(c.state(), TcpState::Closed);
    }

    #[test]
    fn test_packetize_chunks_at_mss() {
        let mut c = TcpControl::with_iss(key(), &syn(1000, Some(100), None), &TcpConfig::default(), DEFAULT_MTU, 5000);
        c.connecting();
        c.on_connected().unwrap();
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let packets = c.packetize(&data).unwrap();
        assert_eq!(packets.len(), 3);

        let infos: Vec<TcpInfo> = packets.iter().map(|p| tcp_of(p)).collect();
        assert_eq!(infos.iter().map(|t| t.seq).collect::<Vec<_>>(), vec![5001, 5101, 5201]);
        assert_eq!(infos[2].payload_len, 50);
        assert!(!infos[0].flags.psh && !infos[1].flags.psh && infos[2].flags.psh);
        assert!(infos.iter().all(|t| t.ack == 1001));
        assert_eq!(c.local_seq(), 5251);
    }

    #[test]
    fn test_connect_failed_rst() {
        let mut c = TcpControl::with_iss(key(), &syn(1000, None, None), &TcpConfig::default(), DEFAULT_MTU, 42);
        c.connecting();
        let rst = tcp_of(&c.on_connect_failed());
        assert!(rst.flags.rst);
        assert_eq!((rst.seq, rst.ack), (42, 1001));
        assert_eq!(c.state(), TcpState::Closed);
    }

    #[test]
    fn test_sequence_wraparound() {
        assert!(seq_before(u32::MAX - 5, 10));
        assert!(seq_after(10, u32::MAX - 5));
        let mut c = established(u32::MAX - 1, &TcpConfig::default());
        c.process(&info(2, 5001, TcpFlags::ack_only(), 4), b"wxyz").unwrap();
        c.process(&info(u32::MAX - 1, 5001, TcpFlags::ack_only(), 4), b"abcd").unwrap();
        assert_eq!(c.remote_seq(), 6);
        let mut w = Trickle::new(3);
        flush_all(&mut c, &mut w);
        assert_eq!(w.out, b"abcdwxyz");
    }

    #[test]
    fn test_segment_queue_order() {
        let mut q = SegmentQueue::new();
        assert!(q.insert(Segment::new(300, &[0; 10], false)));
        assert!(q.insert(Segment::new(100, &[0; 10], false)));
        assert!(q.insert(Segment::new(200, &[0; 10], false)));
        assert!(!q.insert(Segment::new(200, &[0; 20], false)));
        let order: Vec<u32> = q.segments.iter().map(|s| s.seq).collect();
        assert_eq!(order, vec![100, 200, 300]);
        assert_eq!(q.bytes(), 30);
        assert_eq!(q.contiguous_end(100), 110);
        assert_eq!(q.contiguous_end(90), 90);
    }
}
