//! Domain / IP blocklist
//!
//! Entries are domains (or IP literals). A hostname is blocked when it equals an
//! enabled entry or ends with `"." + entry`. A leading dot (`.example.com`) is
//! accepted and means the same as the bare domain. An IP is blocked when it is an
//! enabled IP-literal entry or belongs to the resolved-address index, which the
//! resolver loop rebuilds after every refresh.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Blocklist and resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    /// Entries enabled at startup
    pub domains: Vec<String>,
    /// Periodic re-resolution interval
    pub refresh_interval_secs: u64,
    /// Bound on one full resolution round
    pub resolve_timeout_secs: u64,
    /// Parallel lookups per round
    pub lookup_concurrency: usize,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            refresh_interval_secs: 300,
            resolve_timeout_secs: 30,
            lookup_concurrency: 5,
        }
    }
}

impl BlocklistConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }
}

/// One blocklist entry and its cached resolution
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub domain: String,
    pub enabled: bool,
    pub resolved: HashSet<Ipv4Addr>,
    pub last_resolved: Option<Instant>,
}

impl BlockEntry {
    fn new(domain: String, enabled: bool) -> Self {
        Self { domain, enabled, resolved: HashSet::new(), last_resolved: None }
    }

    /// IP-literal entries block themselves and need no lookup.
    pub fn literal_ip(&self) -> Option<IpAddr> {
        self.domain.parse().ok()
    }
}

fn normalize(entry: &str) -> String {
    entry
        .trim()
        .trim_start_matches('.')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn domain_matches(host: &str, blocked: &str) -> bool {
    host == blocked
        || (host.len() > blocked.len()
            && host.ends_with(blocked)
            && host.as_bytes()[host.len() - blocked.len() - 1] == b'.')
}

/// Concurrent blocklist shared by the flow handlers and the resolver loop
pub struct Blocklist {
    entries: DashMap<String, BlockEntry>,
    ip_index: RwLock<Arc<HashSet<Ipv4Addr>>>,
    changed: Notify,
}

impl Blocklist {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            ip_index: RwLock::new(Arc::new(HashSet::new())),
            changed: Notify::new(),
        }
    }

    /// Build a blocklist whose initial entries are all enabled.
    pub fn with_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = Self::new();
        for d in domains {
            let d = normalize(d.as_ref());
            if !d.is_empty() {
                list.entries.insert(d.clone(), BlockEntry::new(d, true));
            }
        }
        list
    }

    /// Whether a hostname or IP literal is blocked.
    pub fn is_blocked(&self, host_or_ip: &str) -> bool {
        let host = normalize(host_or_ip);
        if host.is_empty() {
            return false;
        }

        let by_name = self
            .entries
            .iter()
            .any(|e| e.enabled && domain_matches(&host, e.key()));
        if by_name {
            return true;
        }

        match host.parse::<Ipv4Addr>() {
            Ok(ip) => self.ip_index.read().contains(&ip),
            Err(_) => false,
        }
    }

    /// Fast path for the packet handlers: IP literal entries or resolved addresses.
    pub fn is_ip_blocked(&self, ip: Ipv4Addr) -> bool {
        if self.ip_index.read().contains(&ip) {
            return true;
        }
        self.entries
            .get(&ip.to_string())
            .map(|e| e.enabled)
            .unwrap_or(false)
    }

    /// Add an enabled entry. Returns false if it already existed.
    pub fn add(&self, domain: &str) -> bool {
        let d = normalize(domain);
        if d.is_empty() || self.entries.contains_key(&d) {
            return false;
        }
        info!("Blocklist: added {}", d);
        self.entries.insert(d.clone(), BlockEntry::new(d, true));
        self.changed.notify_one();
        true
    }

    /// Remove an entry. Its resolved addresses leave the index on the next refresh.
    pub fn remove(&self, domain: &str) -> bool {
        let d = normalize(domain);
        let removed = self.entries.remove(&d).is_some();
        if removed {
            info!("Blocklist: removed {}", d);
            self.changed.notify_one();
        }
        removed
    }

    /// Enable or disable an entry. Returns false if no such entry.
    pub fn set_enabled(&self, domain: &str, enabled: bool) -> bool {
        let d = normalize(domain);
        let found = match self.entries.get_mut(&d) {
            Some(mut e) => {
                e.enabled = enabled;
                true
            }
            None => false,
        };
        if found {
            info!("Blocklist: {} {}", if enabled { "enabled" } else { "disabled" }, d);
            self.changed.notify_one();
        }
        found
    }

    pub fn entries(&self) -> Vec<BlockEntry> {
        let mut v: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        v.sort_by(|a, b| a.domain.cmp(&b.domain));
        v
    }

    /// Enabled entries that need DNS resolution (IP literals excluded).
    pub fn domains_to_resolve(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.enabled && e.literal_ip().is_none())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Store a successful lookup. Entries removed meanwhile are ignored.
    pub fn record_resolution(&self, domain: &str, ips: impl IntoIterator<Item = IpAddr>) {
        if let Some(mut entry) = self.entries.get_mut(domain) {
            let v4: HashSet<Ipv4Addr> = ips
                .into_iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect();
            if v4.is_empty() {
                return;
            }
            debug!("Resolved {} to {} IPs", domain, v4.len());
            entry.resolved = v4;
            entry.last_resolved = Some(Instant::now());
        }
    }

    /// Recompute the resolved-IP index from enabled entries and publish it.
    pub fn rebuild_ip_index(&self) -> usize {
        let mut set = HashSet::new();
        for e in self.entries.iter().filter(|e| e.enabled) {
            set.extend(e.resolved.iter().copied());
            if let Some(IpAddr::V4(ip)) = e.literal_ip() {
                set.insert(ip);
            }
        }
        let count = set.len();
        *self.ip_index.write() = Arc::new(set);
        count
    }

    pub fn blocked_ip_count(&self) -> usize {
        self.ip_index.read().len()
    }

    /// Wait until the next mutation.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_suffix_match() {
        let list = Blocklist::with_domains(["Example.com"]);
        assert!(list.is_blocked("example.com"));
        assert!(list.is_blocked("ads.EXAMPLE.com"));
        assert!(list.is_blocked("a.b.example.com."));
        assert!(!list.is_blocked("notexample.com"));
        assert!(!list.is_blocked("example.com.evil"));
        assert!(!list.is_blocked(""));
    }

    #[test]
    fn test_leading_dot_entry() {
        let list = Blocklist::with_domains([".example.com"]);
        assert!(list.is_blocked("example.com"));
        assert!(list.is_blocked("cdn.example.com"));
        assert!(!list.is_blocked("badexample.com"));
        assert_eq!(list.domains_to_resolve(), vec!["example.com".to_string()]);

        assert!(!list.add("example.com"));
        assert!(!list.add("."));
        assert!(list.remove(".EXAMPLE.com"));
        assert!(list.is_empty());
    }

    #[test]
    fn test_disable_and_remove() {
        let list = Blocklist::new();
        assert!(list.add("tracker.net"));
        assert!(!list.add("TRACKER.net"));
        assert!(list.is_blocked("x.tracker.net"));

        assert!(list.set_enabled("tracker.net", false));
        assert!(!list.is_blocked("x.tracker.net"));
        assert!(!list.set_enabled("missing.net", true));

        assert!(list.set_enabled("tracker.net", true));
        assert!(list.remove("tracker.net"));
        assert!(!list.remove("tracker.net"));
        assert!(!list.is_blocked("tracker.net"));
    }

    #[test]
    fn test_resolved_ip_index() {
        let list = Blocklist::with_domains(["ads.example.com"]);
        let ip: Ipv4Addr = "203.0.113.7".parse().unwrap();
        assert!(!list.is_ip_blocked(ip));

        list.record_resolution("ads.example.com", vec![IpAddr::V4(ip), "::1".parse().unwrap()]);
        // Not visible until the index is published
        assert!(!list.is_ip_blocked(ip));
        assert_eq!(list.rebuild_ip_index(), 1);
        assert!(list.is_ip_blocked(ip));
        assert!(list.is_blocked("203.0.113.7"));

        list.remove("ads.example.com");
        assert!(list.is_ip_blocked(ip));
        list.rebuild_ip_index();
        assert!(!list.is_ip_blocked(ip));
    }

    #[test]
    fn test_failed_resolution_keeps_previous() {
        let list = Blocklist::with_domains(["cdn.example.org"]);
        let ip: Ipv4Addr = "198.51.100.1".parse().unwrap();
        list.record_resolution("cdn.example.org", vec![IpAddr::V4(ip)]);
        list.record_resolution("cdn.example.org", Vec::new());
        list.rebuild_ip_index();
        assert!(list.is_ip_blocked(ip));
    }

    #[test]
    fn test_ip_literal_entry() {
        let list = Blocklist::with_domains(["192.0.2.9"]);
        assert!(list.is_ip_blocked("192.0.2.9".parse().unwrap()));
        assert!(list.domains_to_resolve().is_empty());
        assert_eq!(list.rebuild_ip_index(), 1);
    }
}
