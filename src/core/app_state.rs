//! Application State Management
//!
//! The shared services every part of the server needs: configuration, the
//! priority registry, the round coordinator and metrics. Built once at startup
//! and handed to the acceptor, the workers and the side-channel listener.

use crate::core::config::Config;
use crate::core::error::Result;
use crate::scheduler::{PriorityRegistry, RoundCoordinator};
use crate::system::metrics::Metrics;
use std::sync::Arc;

/// Central application state holding all shared services
pub struct AppState {
    /// Application configuration
    pub config: Config,

    /// Clients ranked by reported speed
    pub registry: Arc<PriorityRegistry>,

    /// Round barrier over adaptive connections
    pub coordinator: Arc<RoundCoordinator>,

    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Build the shared services from a validated configuration
    pub fn new(config: Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let registry = Arc::new(PriorityRegistry::new(config.scheduler.clone()));
        let coordinator = Arc::new(RoundCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config,
            registry,
            coordinator,
            metrics,
        })
    }

    /// Whether the adaptive scheduler is enabled
    pub fn adaptive(&self) -> bool {
        self.config.server.adaptive
    }
}
