//! Error types and handling for the file server
//!
//! Every error here is recovered at the boundary where it occurs: a rejected
//! connection is closed, a malformed side channel is dropped. None of them are
//! allowed to take down the pool or the coordinator.

use crate::core::types::ClientId;
use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the file server
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker pool refused or failed to take a connection
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Wire protocol violations
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Round scheduling errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// An operation assumed a client was registered but it was not
    #[error("Client {0} is not present in the priority registry")]
    RegistryInconsistency(ClientId),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Reasons the worker pool refuses a connection
#[derive(Error, Debug)]
pub enum PoolError {
    /// No cached worker and the live-worker count is at its maximum
    #[error("Worker limit reached ({max_workers} live workers)")]
    AtCapacity {
        /// Configured maximum number of live workers
        max_workers: usize,
    },

    /// The pool is draining and takes no new work
    #[error("Server is shutting down")]
    ShuttingDown,

    /// The OS refused to create a worker thread
    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailure(#[source] std::io::Error),
}

/// Side-channel and request-line protocol violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Side-channel handshake was not a newline-terminated decimal client id
    #[error("Malformed handshake: {0:?}")]
    MalformedHandshake(String),

    /// Speed update was not a newline-terminated decimal integer
    #[error("Malformed speed update: {0:?}")]
    MalformedSpeedUpdate(String),
}

/// Round coordinator errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// Shutdown cancelled a wait for the caller's tier
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error means a connection was turned away rather than failed
    pub fn is_connection_rejection(&self) -> bool {
        matches!(
            self,
            Error::Pool(PoolError::AtCapacity { .. }) | Error::Pool(PoolError::ShuttingDown)
        )
    }

    /// Check if this error was caused by the remote peer's input
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::RegistryInconsistency(_))
    }
}
