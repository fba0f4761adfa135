//! NetSniff Engine - user-space packet forwarding for TUN-style interfaces
//!
//! The engine reads raw IPv4 packets from a virtual interface, terminates the
//! device's TCP connections in user space, relays UDP datagrams, and forwards
//! both over ordinary sockets to the real destinations. Replies are turned back
//! into synthesized IP packets and written to the interface. Destinations whose
//! addresses belong to a blocklisted domain are silently dropped.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                  Virtual interface (TUN fd)                 |
//! +-------------------------------------------------------------+
//!          | read loop                       ^ write loop
//!          v                                 |
//! +-------------------------------+   +-----------------------+
//! | Stack                         |-->| PacketQueue (bounded) |
//! |  parse -> blocklist -> flow   |   +-----------------------+
//! |  +-----------+ +-----------+  |
//! |  | TcpFlow   | | UdpFlow   |  |<-- Multiplexer (mio readiness)
//! |  +-----------+ +-----------+  |
//! +-------------------------------+
//!          |                 ^
//!          v                 |
//! +-------------------------------------------------------------+
//! |        Real sockets (protected, non-blocking, socket2)      |
//! +-------------------------------------------------------------+
//!
//!   Resolver thread: blocklisted domains -> resolved IPv4 index
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use netsniff_engine::EngineBuilder;
//!
//! let engine = EngineBuilder::new()
//!     .mtu(1500)
//!     .block_domain("ads.example.com")
//!     .protector(std::sync::Arc::new(|fd| vpn_service.protect(fd)))
//!     .build()?;
//!
//! engine.start_with_fd(tun_fd)?;
//! // ...
//! engine.stop();
//! ```

pub mod blocklist;
pub mod checksum;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod mux;
pub mod nat;
pub mod packet;
pub mod resolver;
pub mod stack;
pub mod stats;
pub mod tcp;
pub mod udp;


// Re-exports for convenience
pub use blocklist::{BlockEntry, Blocklist, BlocklistConfig};
pub use config::{EngineBuilder, EngineConfig};
pub use device::{ChannelInterface, ChannelPeer, DeviceConfig, FdInterface, PacketQueue, VirtualInterface};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use hooks::{
    AppInfo, AppResolver, CaptureQueue, CaptureSink, Direction, FlowOwnerHint, NoProtect, PacketEvent, Protocol,
    SocketProtector, TrafficRecord, TrafficSink,
};
pub use logging::{init_logging, LogLevel};
pub use nat::{FlowKey, FlowRef};
pub use packet::{parse_packet, ParsedPacket, TcpFlags, TcpInfo, TransportInfo, UdpInfo};
pub use resolver::{BlocklistResolver, HickoryLookup, HostLookup};
pub use stats::{StackStats, StatsSnapshot};
pub use tcp::{TcpConfig, TcpState};
pub use udp::UdpConfig;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::{EngineBuilder, EngineConfig};
    pub use crate::engine::Engine;
    pub use crate::error::{EngineError, Result};
    pub use crate::hooks::{CaptureSink, SocketProtector, TrafficSink};
}
