//! Background resolution of blocklisted domains
//!
//! Every enabled domain is looked up with bounded parallelism; one round is
//! capped by a total wait. Results land in the [`Blocklist`] as they complete, so
//! a round cut short by the deadline still publishes what it has. Failed lookups
//! leave that domain's previous addresses untouched.

use crate::blocklist::{Blocklist, BlocklistConfig};
use crate::error::{EngineError, Result};
use crate::stats::StackStats;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use hickory_proto::xfer::Protocol;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver as HickoryResolver;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name lookup used by the resolver loop
#[async_trait]
pub trait HostLookup: Send + Sync {
    async fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>>;
}

/// Lookup through plain DNS servers using hickory
pub struct HickoryLookup {
    resolver: HickoryResolver<TokioConnectionProvider>,
}

impl HickoryLookup {
    /// Query the given servers over UDP port 53, or hickory's defaults when empty.
    pub fn new(servers: &[IpAddr]) -> Self {
        let mut config = ResolverConfig::new();
        for ip in servers {
            config.add_name_server(NameServerConfig::new(SocketAddr::new(*ip, 53), Protocol::Udp));
        }
        if config.name_servers().is_empty() {
            config = ResolverConfig::default();
        }

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;

        let resolver = HickoryResolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();
        Self { resolver }
    }
}

#[async_trait]
impl HostLookup for HickoryLookup {
    async fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let response = self
            .resolver
            .lookup_ip(domain)
            .await
            .map_err(|e| EngineError::Dns(format!("lookup failed for {}: {}", domain, e)))?;
        Ok(response.iter().collect())
    }
}

/// Outcome of one resolution round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveReport {
    pub resolved: usize,
    pub failed: usize,
    pub timed_out: bool,
    pub blocked_ips: usize,
}

/// Periodically re-resolves the blocklist and refreshes on every mutation
pub struct BlocklistResolver {
    blocklist: Arc<Blocklist>,
    lookup: Arc<dyn HostLookup>,
    config: BlocklistConfig,
    stats: Arc<StackStats>,
}

impl BlocklistResolver {
    pub fn new(
        blocklist: Arc<Blocklist>,
        lookup: Arc<dyn HostLookup>,
        config: BlocklistConfig,
        stats: Arc<StackStats>,
    ) -> Self {
        Self { blocklist, lookup, config, stats }
    }

    /// Resolve every enabled domain once and publish the new IP index.
    pub async fn resolve_all(&self) -> ResolveReport {
        let domains = self.blocklist.domains_to_resolve();
        let mut report = ResolveReport::default();

        if !domains.is_empty() {
            debug!("Resolving {} blocked domains", domains.len());
            let concurrency = self.config.lookup_concurrency.max(1);
            let lookup = self.lookup.clone();

            let mut results = stream::iter(domains)
                .map(|domain| {
                    let lookup = lookup.clone();
                    async move {
                        let result = lookup.lookup(&domain).await;
                        (domain, result)
                    }
                })
                .buffer_unordered(concurrency);

            let round = async {
                while let Some((domain, result)) = results.next().await {
                    match result {
                        Ok(ips) => {
                            self.blocklist.record_resolution(&domain, ips);
                            self.stats.record_resolve_ok();
                            report.resolved += 1;
                        }
                        Err(e) => {
                            warn!("Failed to resolve blocked domain {}: {}", domain, e);
                            self.stats.record_resolve_failure();
                            report.failed += 1;
                        }
                    }
                }
            };

            if tokio::time::timeout(self.config.resolve_timeout(), round).await.is_err() {
                warn!("Blocklist resolution exceeded {:?}, publishing partial results", self.config.resolve_timeout());
                report.timed_out = true;
            }
        }

        report.blocked_ips = self.blocklist.rebuild_ip_index();
        info!(
            "Blocklist resolution complete: {} resolved, {} failed, {} blocked IPs",
            report.resolved, report.failed, report.blocked_ips
        );
        report
    }

    /// Resolve now, then again on every interval tick or blocklist mutation, until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Blocklist resolver started");
        let mut interval = tokio::time::interval(self.config.refresh_interval());
        // The first tick completes immediately and drives the initial round
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.blocklist.changed() => {
                    debug!("Blocklist changed, refreshing");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.resolve_all() => {}
            }
        }
        info!("Blocklist resolver stopped");
    }
}
