//! Flow table for connection tracking
//!
//! Two concurrent maps keyed by the 4-tuple, one per protocol, plus a token index
//! so readiness events can find the flow that owns a socket. Each flow sits behind
//! its own mutex; the maps themselves never need an outer lock.

use dashmap::DashMap;
use mio::Token;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Client endpoint and real destination of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Device-side endpoint (packet source)
    pub src: SocketAddrV4,
    /// Network-side endpoint (packet destination)
    pub dst: SocketAddrV4,
}

impl FlowKey {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Registered socket owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowRef {
    Tcp(FlowKey),
    Udp(FlowKey),
}

impl FlowRef {
    pub fn key(&self) -> FlowKey {
        match self {
            FlowRef::Tcp(k) | FlowRef::Udp(k) => *k,
        }
    }
}

/// What the table needs to know about a flow to track it
pub trait TrackedFlow: Send {
    fn last_activity(&self) -> Instant;
}

pub type SharedFlow<T> = Arc<Mutex<T>>;

struct Slot<T> {
    token: Token,
    flow: SharedFlow<T>,
}

/// Concurrent TCP and UDP flow maps
pub struct FlowTable<T, U> {
    tcp: DashMap<FlowKey, Slot<T>>,
    udp: DashMap<FlowKey, Slot<U>>,
    tokens: DashMap<Token, FlowRef>,
    next_token: AtomicUsize,
}

impl<T: TrackedFlow, U: TrackedFlow> FlowTable<T, U> {
    pub fn new() -> Self {
        Self {
            tcp: DashMap::new(),
            udp: DashMap::new(),
            tokens: DashMap::new(),
            next_token: AtomicUsize::new(1),
        }
    }

    /// Allocate a token for a socket about to be registered.
    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert_tcp(&self, key: FlowKey, token: Token, flow: T) -> SharedFlow<T> {
        let flow = Arc::new(Mutex::new(flow));
        self.tokens.insert(token, FlowRef::Tcp(key));
        if let Some(old) = self.tcp.insert(key, Slot { token, flow: flow.clone() }) {
            self.tokens.remove(&old.token);
        }
        flow
    }

    pub fn insert_udp(&self, key: FlowKey, token: Token, flow: U) -> SharedFlow<U> {
        let flow = Arc::new(Mutex::new(flow));
        self.tokens.insert(token, FlowRef::Udp(key));
        if let Some(old) = self.udp.insert(key, Slot { token, flow: flow.clone() }) {
            self.tokens.remove(&old.token);
        }
        flow
    }

    pub fn get_tcp(&self, key: &FlowKey) -> Option<SharedFlow<T>> {
        self.tcp.get(key).map(|s| s.flow.clone())
    }

    pub fn get_udp(&self, key: &FlowKey) -> Option<SharedFlow<U>> {
        self.udp.get(key).map(|s| s.flow.clone())
    }

    /// Find the flow owning a registered socket.
    pub fn lookup_token(&self, token: Token) -> Option<FlowRef> {
        self.tokens.get(&token).map(|r| *r)
    }

    pub fn remove_tcp(&self, key: &FlowKey) -> Option<SharedFlow<T>> {
        let (_, slot) = self.tcp.remove(key)?;
        self.tokens.remove(&slot.token);
        Some(slot.flow)
    }

    pub fn remove_udp(&self, key: &FlowKey) -> Option<SharedFlow<U>> {
        let (_, slot) = self.udp.remove(key)?;
        self.tokens.remove(&slot.token);
        Some(slot.flow)
    }

    /// Flows with no activity for longer than `timeout`, regardless of protocol state.
    pub fn idle_flows(&self, timeout: Duration, now: Instant) -> Vec<FlowRef> {
        let idle = |last: Instant| now.saturating_duration_since(last) > timeout;

        let mut out: Vec<FlowRef> = self
            .tcp
            .iter()
            .filter(|e| idle(e.flow.lock().last_activity()))
            .map(|e| FlowRef::Tcp(*e.key()))
            .collect();
        out.extend(
            self.udp
                .iter()
                .filter(|e| idle(e.flow.lock().last_activity()))
                .map(|e| FlowRef::Udp(*e.key())),
        );
        out
    }

    /// Remove every flow, handing them back for closing.
    pub fn drain(&self) -> (Vec<SharedFlow<T>>, Vec<SharedFlow<U>>) {
        let tcp_keys: Vec<FlowKey> = self.tcp.iter().map(|e| *e.key()).collect();
        let udp_keys: Vec<FlowKey> = self.udp.iter().map(|e| *e.key()).collect();
        let tcp = tcp_keys.iter().filter_map(|k| self.remove_tcp(k)).collect();
        let udp = udp_keys.iter().filter_map(|k| self.remove_udp(k)).collect();
        self.tokens.clear();
        (tcp, udp)
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_count(&self) -> usize {
        self.udp.len()
    }

    pub fn len(&self) -> usize {
        self.tcp.len() + self.udp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: TrackedFlow, U: TrackedFlow> Default for FlowTable<T, U> {
    fn default() -> Self {
        Self::new()
    }
}
