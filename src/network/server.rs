//! Server wiring
//!
//! Binds the listeners, builds the worker pool, and runs the acceptor (plus
//! the side-channel listener in adaptive mode) until shutdown. Shutdown stops
//! the listeners first, then cancels round waits, then drains the pool.

use crate::core::app_state::AppState;
use crate::core::error::{Error, Result};
use crate::executor::{PoolStats, WorkerPool};
use crate::network::acceptor::Acceptor;
use crate::network::session::FileSession;
use crate::network::side_channel::SideChannelListener;
use crate::network::wait_for_shutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Triggers a graceful shutdown of a running [`Server`]
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<watch::Sender<bool>>,
    pool: Arc<WorkerPool<FileSession>>,
}

impl ServerHandle {
    /// Start shutting down; repeated calls are no-ops
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether shutdown has started
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Current pool bookkeeping
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// A bound, not yet running file server
pub struct Server {
    state: Arc<AppState>,
    pool: Arc<WorkerPool<FileSession>>,
    listener: TcpListener,
    side_listener: Option<TcpListener>,
    port: u16,
    adaptive_port: Option<u16>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Bind the primary listener, and the side-channel listener in adaptive mode.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(state: Arc<AppState>) -> Result<Self> {
        let server = &state.config.server;

        let listener = bind_listener(SocketAddr::new(server.bind_addr, server.port), server.listen_backlog)?;
        let port = listener.local_addr()?.port();

        let (side_listener, adaptive_port) = if server.adaptive {
            let side = bind_listener(SocketAddr::new(server.bind_addr, server.adaptive_port), server.listen_backlog)?;
            let side_port = side.local_addr()?.port();
            (Some(side), Some(side_port))
        } else {
            (None, None)
        };

        let pool = Arc::new(WorkerPool::new(
            state.config.pool.clone(),
            FileSession::new(Arc::clone(&state), adaptive_port),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            state,
            pool,
            listener,
            side_listener,
            port,
            adaptive_port,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Port of the primary listener
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Port of the side-channel listener, in adaptive mode
    pub fn adaptive_port(&self) -> Option<u16> {
        self.adaptive_port
    }

    /// Handle for stopping the server once it runs
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
            pool: Arc::clone(&self.pool),
        }
    }

    /// Serve until a [`ServerHandle`] requests shutdown, then shut down in order
    pub async fn run(self) -> Result<()> {
        let Server {
            state,
            pool,
            listener,
            side_listener,
            shutdown,
            ..
        } = self;

        let acceptor = tokio::spawn(
            Acceptor::new(listener, Arc::clone(&pool), Arc::clone(&state.metrics)).run(shutdown.subscribe()),
        );
        let side_channels = side_listener.map(|side| {
            tokio::spawn(SideChannelListener::new(side, Arc::clone(&state)).run(shutdown.subscribe()))
        });

        let mut signal = shutdown.subscribe();
        wait_for_shutdown(&mut signal).await;
        info!("Shutting down server...");

        if let Err(e) = acceptor.await {
            error!("Acceptor task failed: {}", e);
        }
        if let Some(side_channels) = side_channels {
            if let Err(e) = side_channels.await {
                error!("Side-channel listener failed: {}", e);
            }
        }

        state.coordinator.shutdown();

        let draining = Arc::clone(&pool);
        tokio::task::spawn_blocking(move || draining.shutdown())
            .await
            .map_err(|e| Error::internal(format!("Worker pool shutdown failed: {}", e)))?;

        debug!("Final metrics:\n{}", state.metrics.render()?);
        info!("Shutdown complete");
        Ok(())
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}
