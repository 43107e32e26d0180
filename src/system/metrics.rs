//! Metrics collection for the file server
//!
//! Prometheus counters and gauges grouped by subsystem. Each [`Metrics`] owns
//! its own [`Registry`] so that several servers (or tests) can live in one
//! process without colliding on metric names.

use crate::core::error::Result;
use crate::core::types::Tier;
use crate::executor::PoolStats;
use prometheus::{
    core::Collector, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Primary listener and per-request counters
pub struct ConnectionMetrics {
    /// Connections handed to the pool
    pub accepted: IntCounter,
    /// Connections refused because the pool was full or draining
    pub rejected: IntCounter,
    /// Sessions that ran to completion
    pub sessions_completed: IntCounter,
    /// Requests answered with a file
    pub requests_served: IntCounter,
    /// Requests answered with an error line
    pub requests_failed: IntCounter,
    /// File payload bytes written
    pub bytes_sent: IntCounter,
}

/// Side channel and round scheduling counters
pub struct SchedulerMetrics {
    /// Side channels that completed their handshake
    pub handshakes: IntCounter,
    /// Side channels dropped before or during the handshake
    pub handshakes_rejected: IntCounter,
    /// Speed reports by outcome (`valid` or `malformed`)
    pub speed_updates: IntCounterVec,
    /// Round releases by tier
    pub rounds_released: IntCounterVec,
    /// Clients currently in the priority registry
    pub registered_clients: IntGauge,
}

/// Worker pool gauges
pub struct PoolMetrics {
    /// Active or cached workers
    pub live_workers: IntGauge,
    /// Workers idling in the cache
    pub cached_workers: IntGauge,
}

/// All server metrics
pub struct Metrics {
    registry: Registry,
    /// Connection and request metrics
    pub connections: ConnectionMetrics,
    /// Scheduler metrics
    pub scheduler: SchedulerMetrics,
    /// Pool metrics
    pub pool: PoolMetrics,
}

impl Metrics {
    /// Create and register a fresh set of metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("tfs".to_string()), None)?;

        let connections = ConnectionMetrics {
            accepted: register(&registry, counter("connections_accepted_total", "Connections handed to the worker pool")?)?,
            rejected: register(&registry, counter("connections_rejected_total", "Connections refused by the worker pool")?)?,
            sessions_completed: register(&registry, counter("sessions_completed_total", "Primary sessions that ended")?)?,
            requests_served: register(&registry, counter("requests_served_total", "Requests answered with a file")?)?,
            requests_failed: register(&registry, counter("requests_failed_total", "Requests answered with an error")?)?,
            bytes_sent: register(&registry, counter("bytes_sent_total", "File payload bytes sent")?)?,
        };

        let scheduler = SchedulerMetrics {
            handshakes: register(&registry, counter("side_channel_handshakes_total", "Completed side-channel handshakes")?)?,
            handshakes_rejected: register(
                &registry,
                counter("side_channel_rejected_total", "Side channels dropped before registering")?,
            )?,
            speed_updates: register(
                &registry,
                IntCounterVec::new(Opts::new("speed_updates_total", "Speed reports received"), &["result"])?,
            )?,
            rounds_released: register(
                &registry,
                IntCounterVec::new(Opts::new("rounds_released_total", "Round releases per tier"), &["tier"])?,
            )?,
            registered_clients: register(&registry, gauge("registered_clients", "Clients in the priority registry")?)?,
        };

        let pool = PoolMetrics {
            live_workers: register(&registry, gauge("live_workers", "Active or cached worker threads")?)?,
            cached_workers: register(&registry, gauge("cached_workers", "Worker threads waiting for reuse")?)?,
        };

        Ok(Self {
            registry,
            connections,
            scheduler,
            pool,
        })
    }

    /// Count a round release for `tier`
    pub fn record_release(&self, tier: Tier) {
        self.scheduler
            .rounds_released
            .with_label_values(&[tier.as_str()])
            .inc();
    }

    /// Count a speed report
    pub fn record_speed_update(&self, valid: bool) {
        let result = if valid { "valid" } else { "malformed" };
        self.scheduler.speed_updates.with_label_values(&[result]).inc();
    }

    /// Copy pool bookkeeping into the worker gauges
    pub fn observe_pool(&self, stats: &PoolStats) {
        self.pool.live_workers.set(stats.workers as i64);
        self.pool.cached_workers.set(stats.cached as i64);
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    Ok(IntCounter::new(name, help)?)
}

fn gauge(name: &str, help: &str) -> Result<IntGauge> {
    Ok(IntGauge::new(name, help)?)
}

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}
