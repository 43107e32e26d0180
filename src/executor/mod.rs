//! Connection executor
//!
//! A cached thread pool: one OS thread per live worker, reused across
//! connections and reclaimed after an idle timeout.

pub mod pool;
pub mod task;

pub use pool::{ConnectionHandler, PoolStats, ShutdownSignal, WorkerContext, WorkerPool};
pub use task::{Assignment, TaskState};
