//! External boundaries of the engine
//!
//! The host supplies socket protection, app attribution, traffic persistence and
//! capture display. Every hook is best-effort: a failing sink never affects
//! forwarding, and the capture path never blocks the read loop.

use crate::error::Result;
use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Bytes of payload rendered into a capture preview
pub const PREVIEW_BYTES: usize = 32;

/// Excludes an engine-owned socket from the virtual interface's routing.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawFd) -> bool;
}

impl<F> SocketProtector for F
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    fn protect(&self, fd: RawFd) -> bool {
        self(fd)
    }
}

/// Protector for hosts whose routing already excludes the engine's sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProtect;

impl SocketProtector for NoProtect {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Traffic direction as seen from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Interface to network
    Outgoing,
    /// Network to interface
    Incoming,
}

/// What the engine knows about a flow when asking who owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowOwnerHint {
    pub protocol: Protocol,
    /// Device-side endpoint
    pub local: SocketAddrV4,
    /// Network-side endpoint
    pub remote: SocketAddrV4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub app_name: String,
    pub package_name: String,
    pub uid: Option<u32>,
}

impl AppInfo {
    pub fn unknown() -> Self {
        Self {
            app_name: "Unknown".to_string(),
            package_name: "unknown".to_string(),
            uid: None,
        }
    }
}

/// Best-effort owner attribution for a flow.
pub trait AppResolver: Send + Sync {
    fn resolve_app(&self, hint: &FlowOwnerHint) -> AppInfo;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownApp;

impl AppResolver for UnknownApp {
    fn resolve_app(&self, _hint: &FlowOwnerHint) -> AppInfo {
        AppInfo::unknown()
    }
}

/// Metadata of one forwarded packet, for persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRecord {
    pub timestamp_ms: u64,
    pub source_ip: Ipv4Addr,
    pub source_port: u16,
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
    pub protocol: Protocol,
    pub direction: Direction,
    pub size: usize,
    pub app_name: String,
    pub package_name: String,
    pub uid: Option<u32>,
    pub domain: Option<String>,
}

/// Fire-and-forget persistence of traffic records.
pub trait TrafficSink: Send + Sync {
    fn record(&self, record: &TrafficRecord) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullTrafficSink;

impl TrafficSink for NullTrafficSink {
    fn record(&self, _record: &TrafficRecord) -> Result<()> {
        Ok(())
    }
}

/// One forwarded packet, for live display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketEvent {
    pub packet_number: u64,
    /// `ip:port`
    pub source: String,
    /// `ip:port`
    pub destination: String,
    pub protocol: Protocol,
    pub direction: Direction,
    pub size: usize,
    pub app_name: String,
    pub package_name: String,
    pub uid: Option<u32>,
    pub timestamp: u64,
    /// Upper-case hex of the first bytes, 16 per line
    pub payload: String,
}

/// Receives capture events. Implementations must not block.
pub trait CaptureSink: Send + Sync {
    fn emit(&self, event: PacketEvent);
}

/// Bounded capture buffer that evicts the oldest event when full
pub struct CaptureQueue {
    queue: ArrayQueue<PacketEvent>,
    evicted: AtomicU64,
}

impl CaptureQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            evicted: AtomicU64::new(0),
        }
    }

    /// Take up to `max` events, oldest first.
    pub fn drain(&self, max: usize) -> Vec<PacketEvent> {
        let mut out = Vec::with_capacity(max.min(self.queue.len()));
        while out.len() < max {
            match self.queue.pop() {
                Some(ev) => out.push(ev),
                None => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl CaptureSink for CaptureQueue {
    fn emit(&self, event: PacketEvent) {
        if self.queue.force_push(event).is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Render the first [`PREVIEW_BYTES`] bytes as `"45 00 .."`, 16 bytes per line.
pub fn hex_preview(data: &[u8]) -> String {
    let mut out = String::with_capacity(PREVIEW_BYTES * 3);
    for (i, b) in data.iter().take(PREVIEW_BYTES).enumerate() {
        let _ = write!(out, "{:02X} ", b);
        if (i + 1) % 16 == 0 {
            out.push('\n');
        }
    }
    out.trim().to_string()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The hook set installed into an engine
#[derive(Clone)]
pub struct Hooks {
    pub protector: Arc<dyn SocketProtector>,
    pub app_resolver: Arc<dyn AppResolver>,
    pub traffic_sink: Arc<dyn TrafficSink>,
    pub capture_sink: Arc<dyn CaptureSink>,
    packet_counter: Arc<AtomicU64>,
}

impl Hooks {
    pub fn new(capture_sink: Arc<dyn CaptureSink>) -> Self {
        Self {
            protector: Arc::new(NoProtect),
            app_resolver: Arc::new(UnknownApp),
            traffic_sink: Arc::new(NullTrafficSink),
            capture_sink,
            packet_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Report one forwarded packet to the traffic and capture sinks.
    ///
    /// `src`/`dst` are the packet's own endpoints, so incoming packets carry the
    /// network side as source. `data` is what gets previewed.
    pub fn observe(
        &self,
        protocol: Protocol,
        direction: Direction,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        size: usize,
        data: &[u8],
    ) {
        let hint = match direction {
            Direction::Outgoing => FlowOwnerHint { protocol, local: src, remote: dst },
            Direction::Incoming => FlowOwnerHint { protocol, local: dst, remote: src },
        };
        let app = self.app_resolver.resolve_app(&hint);
        let timestamp = now_millis();

        let record = TrafficRecord {
            timestamp_ms: timestamp,
            source_ip: *src.ip(),
            source_port: src.port(),
            dest_ip: *dst.ip(),
            dest_port: dst.port(),
            protocol,
            direction,
            size,
            app_name: app.app_name.clone(),
            package_name: app.package_name.clone(),
            uid: app.uid,
            domain: None,
        };
        if let Err(e) = self.traffic_sink.record(&record) {
            debug!("Traffic sink rejected record: {}", e);
        }

        let packet_number = self.packet_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.capture_sink.emit(PacketEvent {
            packet_number,
            source: src.to_string(),
            destination: dst.to_string(),
            protocol,
            direction,
            size,
            app_name: app.app_name,
            package_name: app.package_name,
            uid: app.uid,
            timestamp,
            payload: hex_preview(data),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use parking_lot::Mutex;

    struct FailingSink;

    impl TrafficSink for FailingSink {
        fn record(&self, _record: &TrafficRecord) -> Result<()> {
            Err(EngineError::Sink("database locked".into()))
        }
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<TrafficRecord>>);

    impl TrafficSink for CollectingSink {
        fn record(&self, record: &TrafficRecord) -> Result<()> {
            self.0.lock().push(record.clone());
            Ok(())
        }
    }

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn test_hex_preview_layout() {
        let data: Vec<u8> = (0u8..40).collect();
        let preview = hex_preview(&data);
        let lines: Vec<&str> = preview.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00 01 02"));
        assert!(lines[1].trim_end().ends_with("1F"));
        assert_eq!(hex_preview(&[0xAB]), "AB");
        assert_eq!(hex_preview(&[]), "");
    }

    #[test]
    fn test_capture_queue_drops_oldest() {
        let queue = Arc::new(CaptureQueue::new(2));
        let hooks = Hooks::new(queue.clone());
        for port in [1000, 1001, 1002] {
            hooks.observe(
                Protocol::Udp,
                Direction::Outgoing,
                addr(&format!("10.0.0.2:{}", port)),
                addr("8.8.8.8:53"),
                40,
                &[0x45],
            );
        }
        assert_eq!(queue.evicted(), 1);
        let events = queue.drain(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].source, "10.0.0.2:1001");
        assert_eq!(events[1].packet_number, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failing_sink_does_not_stop_capture() {
        let queue = Arc::new(CaptureQueue::new(4));
        let mut hooks = Hooks::new(queue.clone());
        hooks.traffic_sink = Arc::new(FailingSink);
        hooks.observe(Protocol::Tcp, Direction::Incoming, addr("1.1.1.1:443"), addr("10.0.0.2:5000"), 10, b"hi");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_incoming_record_keeps_packet_endpoints() {
        let sink = Arc::new(CollectingSink::default());
        let mut hooks = Hooks::new(Arc::new(CaptureQueue::new(4)));
        hooks.traffic_sink = sink.clone();
        hooks.observe(Protocol::Tcp, Direction::Incoming, addr("1.1.1.1:443"), addr("10.0.0.2:5000"), 10, b"hi");

        let records = sink.0.lock();
        assert_eq!(records[0].source_port, 443);
        assert_eq!(records[0].dest_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(records[0].app_name, "Unknown");
    }

    #[test]
    fn test_closure_protector() {
        let protector: Arc<dyn SocketProtector> = Arc::new(|fd: RawFd| fd >= 0);
        assert!(protector.protect(3));
        assert!(!protector.protect(-1));
    }
}
