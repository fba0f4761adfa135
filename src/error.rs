//! Error types for the NetSniff forwarding engine

use std::io;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the forwarding engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Packet too large: {size} > MTU {mtu}")]
    PacketTooLarge { size: usize, mtu: usize },

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Virtual interface closed")]
    DeviceClosed,

    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Sink error: {0}")]
    Sink(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    /// Whether the error is a non-blocking socket reporting it has no progress to make
    pub fn is_would_block(&self) -> bool {
        matches!(self, EngineError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}
