//! Engine lifecycle
//!
//! An [`Engine`] owns the shared state (blocklist, flow table, write queue,
//! counters) and, while running, three named threads:
//!
//! - `netsniff-read`: interface reads, packet dispatch and the socket readiness pass
//! - `netsniff-write`: drains the write queue into the interface
//! - `netsniff-resolver`: a current-thread tokio runtime refreshing blocked addresses

use crate::blocklist::Blocklist;
use crate::config::{EngineBuilder, EngineConfig};
use crate::device::{run_read_loop, run_write_loop, FdInterface, PacketQueue, VirtualInterface};
use crate::error::{EngineError, Result};
use crate::hooks::{AppResolver, CaptureQueue, CaptureSink, Hooks, SocketProtector, TrafficSink};
use crate::logging::init_logging;
use crate::mux::Multiplexer;
use crate::resolver::{BlocklistResolver, HickoryLookup, HostLookup};
use crate::stack::{close_all, Flows, Stack};
use crate::stats::{StackStats, StatsSnapshot};
use mio::{Poll, Registry};
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resources that only exist while the engine runs
struct Running {
    iface: Arc<dyn VirtualInterface>,
    registry: Registry,
    cancel: CancellationToken,
    threads: Vec<JoinHandle<()>>,
}

/// The packet forwarding engine
pub struct Engine {
    config: EngineConfig,
    hooks: Hooks,
    capture: Option<Arc<CaptureQueue>>,
    host_lookup: Option<Arc<dyn HostLookup>>,
    blocklist: Arc<Blocklist>,
    flows: Arc<Flows>,
    queue: Arc<PacketQueue>,
    stats: Arc<StackStats>,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    state: Mutex<Option<Running>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn new(
        config: EngineConfig,
        protector: Option<Arc<dyn SocketProtector>>,
        app_resolver: Option<Arc<dyn AppResolver>>,
        traffic_sink: Option<Arc<dyn TrafficSink>>,
        capture_sink: Option<Arc<dyn CaptureSink>>,
        host_lookup: Option<Arc<dyn HostLookup>>,
    ) -> Result<Self> {
        init_logging(config.log_level)?;

        let (capture, capture_sink) = match capture_sink {
            Some(sink) => (None, sink),
            None => {
                let queue = Arc::new(CaptureQueue::new(config.capture_queue_capacity));
                (Some(queue.clone()), queue as Arc<dyn CaptureSink>)
            }
        };
        let mut hooks = Hooks::new(capture_sink);
        if let Some(p) = protector {
            hooks.protector = p;
        }
        if let Some(r) = app_resolver {
            hooks.app_resolver = r;
        }
        if let Some(s) = traffic_sink {
            hooks.traffic_sink = s;
        }

        Ok(Self {
            blocklist: Arc::new(Blocklist::with_domains(&config.blocklist.domains)),
            flows: Arc::new(Flows::new()),
            queue: Arc::new(PacketQueue::new(config.device.write_queue_capacity)),
            stats: Arc::new(StackStats::new()),
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
            config,
            hooks,
            capture,
            host_lookup,
        })
    }

    /// Start forwarding on an already configured interface.
    pub fn start(&self, iface: Arc<dyn VirtualInterface>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyRunning);
        }
        // Held until the handles are stored so a concurrent stop sees them
        let mut state = self.state.lock();
        match self.spawn(iface) {
            Ok(running) => {
                *state = Some(running);
                Ok(())
            }
            Err(e) => {
                error!("Engine failed to start: {}", e);
                self.running.store(false, Ordering::Release);
                self.started.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Start forwarding on a host-provided TUN descriptor. The descriptor is
    /// duplicated, so the caller keeps ownership of `fd`.
    pub fn start_with_fd(&self, fd: RawFd) -> Result<()> {
        let iface = FdInterface::from_raw_fd(fd, self.config.device.clone())?;
        self.start(Arc::new(iface))
    }

    fn spawn(&self, iface: Arc<dyn VirtualInterface>) -> Result<Running> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let stack = Stack::new(
            self.config.stack_config(),
            self.flows.clone(),
            self.blocklist.clone(),
            poll.registry().try_clone()?,
            self.queue.clone(),
            self.hooks.clone(),
            self.stats.clone(),
        );
        let mut mux = Multiplexer::new(poll, stack);
        let cancel = CancellationToken::new();
        let poll_interval = self.config.device.read_poll_interval();

        self.running.store(true, Ordering::Release);
        let mut threads = Vec::with_capacity(3);

        let reader = {
            let iface = iface.clone();
            let running = self.running.clone();
            let stats = self.stats.clone();
            let buffer_size = self.config.device.read_buffer_size;
            thread::Builder::new().name("netsniff-read".into()).spawn(move || {
                run_read_loop(iface.as_ref(), buffer_size, poll_interval, &running, &stats, &mut mux)
            })
        };
        match reader {
            Ok(handle) => threads.push(handle),
            Err(e) => return Err(e.into()),
        }

        let writer = {
            let iface = iface.clone();
            let running = self.running.clone();
            let stats = self.stats.clone();
            let queue = self.queue.clone();
            thread::Builder::new().name("netsniff-write".into()).spawn(move || {
                run_write_loop(iface.as_ref(), &queue, poll_interval, &running, &stats)
            })
        };
        match writer {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                join_all(threads, self.config.shutdown_join_timeout());
                return Err(e.into());
            }
        }

        let resolver = {
            let resolver_config = self.config.blocklist.clone();
            let blocklist = self.blocklist.clone();
            let stats = self.stats.clone();
            let lookup = self.host_lookup.clone();
            let servers = self.config.device.dns_servers.clone();
            let cancel = cancel.clone();
            thread::Builder::new().name("netsniff-resolver".into()).spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Resolver runtime failed to start: {}", e);
                        return;
                    }
                };
                runtime.block_on(async move {
                    let lookup = lookup
                        .unwrap_or_else(|| Arc::new(HickoryLookup::new(&servers)) as Arc<dyn HostLookup>);
                    BlocklistResolver::new(blocklist, lookup, resolver_config, stats)
                        .run(cancel)
                        .await
                });
            })
        };
        match resolver {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                join_all(threads, self.config.shutdown_join_timeout());
                return Err(e.into());
            }
        }

        info!(
            "Engine started on {} (mtu {}, {} blocklist entries)",
            iface.name(),
            iface.mtu(),
            self.blocklist.len()
        );
        Ok(Running { iface, registry, cancel, threads })
    }

    /// Stop forwarding and release every socket. Only the first call does anything.
    pub fn stop(&self) {
        let running = {
            let mut state = self.state.lock();
            if !self.running.swap(false, Ordering::AcqRel) {
                return;
            }
            state.take()
        };
        let Some(running) = running else {
            return;
        };
        info!("Stopping engine");

        running.cancel.cancel();
        join_all(running.threads, self.config.shutdown_join_timeout());

        let closed = close_all(&self.flows, &running.registry, &self.stats);
        running.iface.close();
        let discarded = self.queue.clear();
        info!("Engine stopped: {} flows closed, {} queued packets discarded", closed, discarded);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Blocklist mutation API. Changes trigger a re-resolution.
    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// The default capture queue, absent when a custom capture sink is installed.
    pub fn capture(&self) -> Option<&Arc<CaptureQueue>> {
        self.capture.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_all(threads: Vec<JoinHandle<()>>, timeout: Duration) {
    for handle in threads {
        join_with_timeout(handle, timeout);
    }
}

/// Join a worker, giving up after `timeout`. A thread that overruns is left detached.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let name = handle.thread().name().unwrap_or("worker").to_string();
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("Thread {} did not stop within {:?}", name, timeout);
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        error!("Thread {} panicked", name);
    } else {
        debug!("Thread {} joined", name);
    }
}
