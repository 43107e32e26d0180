//! System monitoring
//!
//! Prometheus metrics for the pool, the sessions and the scheduler.

pub mod metrics;

pub use metrics::Metrics;
