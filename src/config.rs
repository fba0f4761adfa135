//! Engine configuration and builder

use crate::blocklist::BlocklistConfig;
use crate::device::DeviceConfig;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::hooks::{AppResolver, CaptureSink, SocketProtector, TrafficSink};
use crate::logging::LogLevel;
use crate::resolver::HostLookup;
use crate::stack::StackConfig;
use crate::tcp::TcpConfig;
use crate::udp::UdpConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const MIN_MTU: usize = 68;
const MAX_MTU: usize = 65535;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceConfig,
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    pub blocklist: BlocklistConfig,
    /// Flows with no activity for this long are evicted
    pub idle_timeout_secs: u64,
    /// How long `stop` waits for each worker thread
    pub shutdown_join_timeout_ms: u64,
    /// Events held by the default capture queue
    pub capture_queue_capacity: usize,
    pub log_level: LogLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            blocklist: BlocklistConfig::default(),
            idle_timeout_secs: 60,
            shutdown_join_timeout_ms: 1000,
            capture_queue_capacity: 1000,
            log_level: LogLevel::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let mtu = self.device.mtu;
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(EngineError::config(format!("MTU {} outside {}..={}", mtu, MIN_MTU, MAX_MTU)));
        }
        if self.device.write_queue_capacity == 0 {
            return Err(EngineError::config("write_queue_capacity must be non-zero"));
        }
        if self.blocklist.lookup_concurrency == 0 {
            return Err(EngineError::config("lookup_concurrency must be non-zero"));
        }
        if self.device.prefix_len > 32 {
            return Err(EngineError::config(format!("prefix length {} > 32", self.device.prefix_len)));
        }
        for route in &self.device.routes {
            parse_route(route)?;
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_join_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_join_timeout_ms)
    }

    pub fn stack_config(&self) -> StackConfig {
        StackConfig {
            mtu: self.device.mtu,
            idle_timeout: self.idle_timeout(),
            tcp: self.tcp.clone(),
            udp: self.udp.clone(),
        }
    }
}

/// Parse an `a.b.c.d/n` route.
pub fn parse_route(route: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = route
        .split_once('/')
        .ok_or_else(|| EngineError::config(format!("route {} missing prefix length", route)))?;
    let addr: Ipv4Addr = addr
        .trim()
        .parse()
        .map_err(|e| EngineError::config(format!("route {}: {}", route, e)))?;
    let prefix: u8 = prefix
        .trim()
        .parse()
        .map_err(|e| EngineError::config(format!("route {}: {}", route, e)))?;
    if prefix > 32 {
        return Err(EngineError::config(format!("route {}: prefix > 32", route)));
    }
    Ok((addr, prefix))
}

/// Fluent engine construction
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    protector: Option<Arc<dyn SocketProtector>>,
    app_resolver: Option<Arc<dyn AppResolver>>,
    traffic_sink: Option<Arc<dyn TrafficSink>>,
    capture_sink: Option<Arc<dyn CaptureSink>>,
    host_lookup: Option<Arc<dyn HostLookup>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self { config, ..Self::default() }
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.device.mtu = mtu;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn address(mut self, address: Ipv4Addr, prefix_len: u8) -> Self {
        self.config.device.address = address;
        self.config.device.prefix_len = prefix_len;
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.config.device.routes.push(route.into());
        self
    }

    /// Add a DNS server. The first call replaces the defaults.
    pub fn dns_server(mut self, server: IpAddr) -> Self {
        if self.config.device.dns_servers == DeviceConfig::default().dns_servers {
            self.config.device.dns_servers.clear();
        }
        self.config.device.dns_servers.push(server);
        self
    }

    pub fn block_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.blocklist.domains.push(domain.into());
        self
    }

    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.device.write_queue_capacity = capacity;
        self
    }

    pub fn shutdown_join_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_join_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn protector(mut self, protector: Arc<dyn SocketProtector>) -> Self {
        self.protector = Some(protector);
        self
    }

    pub fn app_resolver(mut self, resolver: Arc<dyn AppResolver>) -> Self {
        self.app_resolver = Some(resolver);
        self
    }

    pub fn traffic_sink(mut self, sink: Arc<dyn TrafficSink>) -> Self {
        self.traffic_sink = Some(sink);
        self
    }

    /// Replace the default capture queue.
    pub fn capture_sink(mut self, sink: Arc<dyn CaptureSink>) -> Self {
        self.capture_sink = Some(sink);
        self
    }

    /// Replace DNS lookups of blocklisted domains.
    pub fn host_lookup(mut self, lookup: Arc<dyn HostLookup>) -> Self {
        self.host_lookup = Some(lookup);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        Engine::new(
            self.config,
            self.protector,
            self.app_resolver,
            self.traffic_sink,
            self.capture_sink,
            self.host_lookup,
        )
    }
}
