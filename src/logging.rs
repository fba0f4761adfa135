//! Logging initialisation

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
    Trace,
    Silent,
}

impl LogLevel {
    fn as_tracing(self) -> Option<Level> {
        match self {
            LogLevel::Silent => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warning => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

/// Initialize logging. Only the first call has any effect.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn directive(s: &str) -> Result<tracing_subscriber::filter::Directive> {
    s.parse()
        .map_err(|e| EngineError::config(format!("Invalid log directive {}: {}", s, e)))
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let Some(tracing_level) = level.as_tracing() else {
        return Ok(());
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(directive(&format!("netsniff_engine={}", tracing_level))?)
        .add_directive(directive("hickory_resolver=warn")?)
        .add_directive(directive("hickory_proto=warn")?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .with_filter(filter);

    // Another subscriber may already be installed by the host
    if tracing_subscriber::registry().with(fmt_layer).try_init().is_ok() {
        tracing::info!("Logging initialized at level: {:?}", level);
    }
    Ok(())
}
