//! Tiered File Server - a file-serving daemon with round-based adaptive scheduling
//!
//! Every connection is served on a reusable worker thread. In adaptive mode
//! clients also report a pan speed over a side channel; the server ranks them
//! by that speed into high, medium and low tiers and releases one tier per
//! round, so that every connected client gets its turn.
#![warn(missing_docs)]

// Configure global allocator for maximum performance
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

// Core foundational modules
pub mod core;

// Main functional modules
pub mod executor;
pub mod network;
pub mod scheduler;
pub mod system;

// Re-export commonly used items for convenience
pub use crate::core::{AppState, Config, Error, Result};
pub use network::{Server, ServerHandle};

use crate::core::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| Error::internal(format!("Failed to install logger: {}", e)))?;

    tracing::debug!("Initializing {} v{}", NAME, VERSION);
    Ok(())
}
