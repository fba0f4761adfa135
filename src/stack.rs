//! Packet dispatch coordinator
//!
//! Classifies packets read from the interface, applies the blocklist, creates
//! and feeds flows, and turns socket readiness into synthesized packets on the
//! write queue. Every per-flow failure ends in eviction of that flow only.

use crate::blocklist::Blocklist;
use crate::device::PacketQueue;
use crate::error::{EngineError, Result};
use crate::hooks::{Direction, Hooks, Protocol};
use crate::nat::{FlowKey, FlowRef, FlowTable, SharedFlow};
use crate::packet::{build_tcp_rst, parse_packet, ParsedPacket, TcpInfo, TransportInfo, UdpInfo};
use crate::stats::StackStats;
use crate::tcp::{TcpAction, TcpConfig, TcpControl, TcpFlow, TcpState};
use crate::udp::{UdpConfig, UdpFlow};
use bytes::BytesMut;
use mio::{Registry, Token};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub type Flows = FlowTable<TcpFlow, UdpFlow>;

/// Upper bound on the time between idle sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Stack configuration
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub mtu: usize,
    pub idle_timeout: Duration,
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            idle_timeout: Duration::from_secs(60),
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
        }
    }
}

/// Shared state every flow handler works against
pub struct Stack {
    config: StackConfig,
    flows: Arc<Flows>,
    blocklist: Arc<Blocklist>,
    registry: Registry,
    queue: Arc<PacketQueue>,
    hooks: Hooks,
    stats: Arc<StackStats>,
    recv_buf: Vec<u8>,
    last_sweep: Instant,
}

impl Stack {
    pub fn new(
        config: StackConfig,
        flows: Arc<Flows>,
        blocklist: Arc<Blocklist>,
        registry: Registry,
        queue: Arc<PacketQueue>,
        hooks: Hooks,
        stats: Arc<StackStats>,
    ) -> Self {
        let recv_buf = vec![0u8; config.udp.max_datagram_size.max(config.tcp.socket_buffer_size).max(config.mtu)];
        Self {
            config,
            flows,
            blocklist,
            registry,
            queue,
            hooks,
            stats,
            recv_buf,
            last_sweep: Instant::now(),
        }
    }

    pub fn flows(&self) -> &Arc<Flows> {
        &self.flows
    }

    pub fn stats(&self) -> &Arc<StackStats> {
        &self.stats
    }

    /// Dispatch one raw packet read from the interface.
    pub fn handle_packet(&mut self, raw: &[u8]) {
        let parsed = match parse_packet(raw) {
            Ok(p) => p,
            Err(e) => {
                self.stats.record_invalid();
                trace!("Dropping unparseable packet ({} bytes): {}", raw.len(), e);
                return;
            }
        };

        let result = match &parsed.transport {
            TransportInfo::Tcp(info) => {
                self.stats.record_tcp();
                self.handle_tcp(&parsed, info, raw)
            }
            TransportInfo::Udp(info) => {
                self.stats.record_udp();
                self.handle_udp(&parsed, info, raw)
            }
            TransportInfo::Icmp => {
                self.stats.record_icmp();
                self.stats.record_dropped();
                trace!("ICMP {} -> {} not forwarded", parsed.src_addr, parsed.dst_addr);
                Ok(())
            }
            TransportInfo::Other(proto) => {
                self.stats.record_other();
                self.stats.record_dropped();
                trace!("Protocol {} {} -> {} not forwarded", proto, parsed.src_addr, parsed.dst_addr);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Packet handling failed: {}", e);
        }
    }

    fn is_blocked(&self, dst: Ipv4Addr) -> bool {
        if self.blocklist.is_ip_blocked(dst) {
            self.stats.record_blocked();
            debug!("Blocked destination {}", dst);
            return true;
        }
        false
    }

    fn emit(&self, packet: BytesMut) {
        if !self.queue.offer(packet) {
            self.stats.record_write_queue_drop();
            trace!("Write queue full, dropping packet");
        }
    }

    fn send_rst(&self, key: &FlowKey, seq: u32, ack: u32) {
        self.stats.record_rst();
        self.emit(build_tcp_rst(key.dst, key.src, seq, ack));
    }

    fn handle_tcp(&mut self, parsed: &ParsedPacket, info: &TcpInfo, raw: &[u8]) -> Result<()> {
        let (Some(src), Some(dst)) = (parsed.src_socket(), parsed.dst_socket()) else {
            return Err(EngineError::InvalidPacket("TCP packet without ports".into()));
        };
        let key = FlowKey::new(src, dst);
        if self.is_blocked(parsed.dst_addr) {
            return Ok(());
        }
        let payload = parsed.payload(raw);

        trace!(
            "TCP {} flags={:?} seq={} ack={} len={}",
            key, info.flags, info.seq, info.ack, payload.len()
        );

        if let Some(flow) = self.flows.get_tcp(&key) {
            let reused = flow.lock().control().is_new_connection(info);
            if reused {
                debug!("New SYN on existing flow, reopening: {}", key);
                self.evict(FlowRef::Tcp(key));
                self.handle_syn(key, info, raw);
                return Ok(());
            }
            let actions = flow.lock().control_mut().process(info, payload);
            return match actions {
                Ok(actions) => {
                    self.execute(key, &flow, actions);
                    Ok(())
                }
                Err(e) => {
                    self.evict(FlowRef::Tcp(key));
                    Err(e)
                }
            };
        }

        if info.flags.syn && !info.flags.ack {
            self.handle_syn(key, info, raw);
        } else if !info.flags.rst && (!payload.is_empty() || info.flags.fin) {
            // Stray segment for a flow we do not know
            let ack = info
                .seq
                .wrapping_add(payload.len() as u32)
                .wrapping_add(info.flags.fin as u32);
            debug!("No flow for {}, sending RST", key);
            self.send_rst(&key, info.ack, ack);
        }
        Ok(())
    }

    fn handle_syn(&mut self, key: FlowKey, info: &TcpInfo, raw: &[u8]) {
        let token = self.flows.next_token();
        let control = TcpControl::new(key, info, &self.config.tcp, self.config.mtu);
        match TcpFlow::open(control, &self.config.tcp, self.hooks.protector.as_ref(), &self.registry, token) {
            Ok(flow) => {
                self.flows.insert_tcp(key, token, flow);
                self.stats.record_tcp_flow();
                self.hooks.observe(Protocol::Tcp, Direction::Outgoing, key.src, key.dst, raw.len(), raw);
                debug!("New TCP flow: {}", key);
            }
            Err(e) => {
                warn!("TCP connect to {} failed: {}", key.dst, e);
                self.send_rst(&key, 0, info.seq.wrapping_add(1));
            }
        }
    }

    fn execute(&mut self, key: FlowKey, flow: &SharedFlow<TcpFlow>, actions: Vec<TcpAction>) {
        let mut actions = VecDeque::from(actions);
        while let Some(action) = actions.pop_front() {
            match action {
                TcpAction::Send(packet) => self.emit(packet),
                TcpAction::EnableWrite => {
                    let armed = flow.lock().set_write_interest(&self.registry, true);
                    if let Err(e) = armed {
                        warn!("Failed to arm write readiness for {}: {}", key, e);
                        self.evict(FlowRef::Tcp(key));
                        return;
                    }
                }
                TcpAction::ShutdownRead => {
                    let drained = {
                        let hooks = &self.hooks;
                        let observe = |data: &[u8]| {
                            hooks.observe(Protocol::Tcp, Direction::Incoming, key.dst, key.src, data.len(), data)
                        };
                        flow.lock().shutdown_read(&mut self.recv_buf, observe)
                    };
                    match drained {
                        Ok(more) => actions.extend(more),
                        Err(e) => {
                            debug!("TCP read shutdown failed for {}: {}", key, e);
                            self.evict(FlowRef::Tcp(key));
                            return;
                        }
                    }
                }
                TcpAction::Close => {
                    self.evict(FlowRef::Tcp(key));
                    return;
                }
            }
        }
    }

    fn handle_udp(&mut self, parsed: &ParsedPacket, _info: &UdpInfo, raw: &[u8]) -> Result<()> {
        let (Some(src), Some(dst)) = (parsed.src_socket(), parsed.dst_socket()) else {
            return Err(EngineError::InvalidPacket("UDP packet without ports".into()));
        };
        let key = FlowKey::new(src, dst);
        if self.is_blocked(parsed.dst_addr) {
            return Ok(());
        }

        let flow = match self.flows.get_udp(&key) {
            Some(flow) => flow,
            None => {
                let token = self.flows.next_token();
                match UdpFlow::open(key, &self.config.udp, self.config.mtu, self.hooks.protector.as_ref(), &self.registry, token) {
                    Ok(flow) => {
                        self.stats.record_udp_flow();
                        self.flows.insert_udp(key, token, flow)
                    }
                    Err(e) => {
                        self.stats.record_dropped();
                        debug!("UDP socket for {} failed, dropping datagram: {}", key, e);
                        return Ok(());
                    }
                }
            }
        };

        let sent = flow.lock().forward(parsed.payload(raw));
        if let Err(e) = sent {
            self.evict(FlowRef::Udp(key));
            return Err(e);
        }
        self.hooks.observe(Protocol::Udp, Direction::Outgoing, key.src, key.dst, raw.len(), raw);
        Ok(())
    }

    /// Handle readiness for a registered socket. A failure evicts only that flow.
    pub fn on_socket_event(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(flow_ref) = self.flows.lookup_token(token) else {
            trace!("Event for unknown token {:?}", token);
            return;
        };
        let result = match flow_ref {
            FlowRef::Tcp(key) => self.tcp_event(key, readable, writable),
            FlowRef::Udp(key) => self.udp_event(key, readable),
        };
        if let Err(e) = result {
            debug!("Flow {} failed: {}", flow_ref.key(), e);
            self.evict(flow_ref);
        }
    }

    fn tcp_event(&mut self, key: FlowKey, readable: bool, writable: bool) -> Result<()> {
        let Some(flow) = self.flows.get_tcp(&key) else {
            return Ok(());
        };

        let mut actions = Vec::new();
        {
            let mut f = flow.lock();
            if f.state() == TcpState::SynSent {
                match f.finish_connect(&self.registry) {
                    Ok(Some(syn_ack)) => actions.push(TcpAction::Send(syn_ack)),
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        debug!("TCP connect to {} failed: {}", key.dst, e);
                        self.stats.record_rst();
                        actions.push(TcpAction::Send(f.control_mut().on_connect_failed()));
                        actions.push(TcpAction::Close);
                    }
                }
            } else {
                if writable {
                    actions.extend(f.on_writable(&self.registry)?);
                }
                if readable {
                    let hooks = &self.hooks;
                    let observe = |data: &[u8]| {
                        hooks.observe(Protocol::Tcp, Direction::Incoming, key.dst, key.src, data.len(), data)
                    };
                    actions.extend(f.on_readable(&mut self.recv_buf, observe)?);
                }
            }
        }

        self.execute(key, &flow, actions);
        Ok(())
    }

    fn udp_event(&mut self, key: FlowKey, readable: bool) -> Result<()> {
        if !readable {
            return Ok(());
        }
        let Some(flow) = self.flows.get_udp(&key) else {
            return Ok(());
        };

        let packets = {
            let hooks = &self.hooks;
            let observe = |data: &[u8]| {
                hooks.observe(Protocol::Udp, Direction::Incoming, key.dst, key.src, data.len(), data)
            };
            flow.lock().on_readable(&mut self.recv_buf, observe)?
        };
        for packet in packets {
            self.emit(packet);
        }
        Ok(())
    }

    /// Remove a flow and close its socket.
    pub fn evict(&mut self, flow_ref: FlowRef) {
        match flow_ref {
            FlowRef::Tcp(key) => {
                if let Some(flow) = self.flows.remove_tcp(&key) {
                    flow.lock().close(&self.registry);
                    self.stats.record_tcp_closed();
                    debug!("TCP flow evicted: {}", key);
                }
            }
            FlowRef::Udp(key) => {
                if let Some(flow) = self.flows.remove_udp(&key) {
                    flow.lock().close(&self.registry);
                    self.stats.record_udp_closed();
                    debug!("UDP flow evicted: {}", key);
                }
            }
        }
    }

    /// Evict every flow idle for longer than the idle timeout.
    pub fn sweep_idle(&mut self, now: Instant) -> usize {
        self.last_sweep = now;
        let idle = self.flows.idle_flows(self.config.idle_timeout, now);
        let count = idle.len();
        for flow_ref in idle {
            debug!("Flow idle for over {:?}: {}", self.config.idle_timeout, flow_ref.key());
            self.stats.record_idle_eviction();
            self.evict(flow_ref);
        }
        count
    }

    /// Sweep if enough time has passed since the last sweep.
    pub fn maybe_sweep(&mut self, now: Instant) -> usize {
        let interval = SWEEP_INTERVAL.min(self.config.idle_timeout);
        if now.saturating_duration_since(self.last_sweep) < interval {
            return 0;
        }
        self.sweep_idle(now)
    }
}

/// Deregister and close every flow. Returns how many were closed.
pub fn close_all(flows: &Flows, registry: &Registry, stats: &StackStats) -> usize {
    let (tcp, udp) = flows.drain();
    let count = tcp.len() + udp.len();
    for flow in tcp {
        flow.lock().close(registry);
        stats.record_tcp_closed();
    }
    for flow in udp {
        flow.lock().close(registry);
        stats.record_udp_closed();
    }
    count
}
