//! Statistics tracking for the forwarding engine
//!
//! Counters are updated lock-free from the read, write and resolver loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Engine-wide statistics
#[derive(Debug, Default)]
pub struct StackStats {
    /// Start time
    start_time: Option<Instant>,

    // Packet statistics
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_invalid: AtomicU64,
    pub packets_blocked: AtomicU64,

    // Byte statistics
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Protocol statistics
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    pub icmp_packets: AtomicU64,
    pub other_packets: AtomicU64,

    // Flow statistics
    pub tcp_flows_total: AtomicU64,
    pub tcp_flows_active: AtomicU64,
    pub udp_flows_total: AtomicU64,
    pub udp_flows_active: AtomicU64,
    pub flows_evicted_idle: AtomicU64,

    // Interface write path
    pub write_queue_drops: AtomicU64,
    pub rsts_sent: AtomicU64,

    // Blocklist resolution
    pub resolve_ok: AtomicU64,
    pub resolve_failures: AtomicU64,
}

impl StackStats {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Record packet read from the interface
    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record packet written to the interface
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.packets_invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// Record packet dropped by the blocklist
    pub fn record_blocked(&self) {
        self.packets_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp(&self) {
        self.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_icmp(&self) {
        self.icmp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_other(&self) {
        self.other_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_flow(&self) {
        self.tcp_flows_total.fetch_add(1, Ordering::Relaxed);
        self.tcp_flows_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_closed(&self) {
        self.tcp_flows_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_udp_flow(&self) {
        self.udp_flows_total.fetch_add(1, Ordering::Relaxed);
        self.udp_flows_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_closed(&self) {
        self.udp_flows_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_idle_eviction(&self) {
        self.flows_evicted_idle.fetch_add(1, Ordering::Relaxed);
    }

    /// Record packet dropped because the interface write queue was full
    pub fn record_write_queue_drop(&self) {
        self.write_queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rst(&self) {
        self.rsts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolve_ok(&self) {
        self.resolve_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolve_failure(&self) {
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_invalid: self.packets_invalid.load(Ordering::Relaxed),
            packets_blocked: self.packets_blocked.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            icmp_packets: self.icmp_packets.load(Ordering::Relaxed),
            other_packets: self.other_packets.load(Ordering::Relaxed),
            tcp_flows_total: self.tcp_flows_total.load(Ordering::Relaxed),
            tcp_flows_active: self.tcp_flows_active.load(Ordering::Relaxed),
            udp_flows_total: self.udp_flows_total.load(Ordering::Relaxed),
            udp_flows_active: self.udp_flows_active.load(Ordering::Relaxed),
            flows_evicted_idle: self.flows_evicted_idle.load(Ordering::Relaxed),
            write_queue_drops: self.write_queue_drops.load(Ordering::Relaxed),
            rsts_sent: self.rsts_sent.load(Ordering::Relaxed),
            resolve_ok: self.resolve_ok.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of statistics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_invalid: u64,
    pub packets_blocked: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub icmp_packets: u64,
    pub other_packets: u64,
    pub tcp_flows_total: u64,
    pub tcp_flows_active: u64,
    pub udp_flows_total: u64,
    pub udp_flows_active: u64,
    pub flows_evicted_idle: u64,
    pub write_queue_drops: u64,
    pub rsts_sent: u64,
    pub resolve_ok: u64,
    pub resolve_failures: u64,
}

impl StatsSnapshot {
    /// Calculate packets per second (requires two snapshots)
    pub fn packets_per_second(&self, previous: &StatsSnapshot, interval: Duration) -> f64 {
        let delta = self.packets_received.saturating_sub(previous.packets_received);
        delta as f64 / interval.as_secs_f64()
    }

    /// Get active flows (TCP + UDP)
    pub fn active_flows(&self) -> u64 {
        self.tcp_flows_active + self.udp_flows_active
    }
}
