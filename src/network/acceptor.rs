//! Connection acceptor
//!
//! Accepts primary connections on the async runtime, numbers them, and hands
//! each one to the worker pool as a blocking socket. Connections the pool can
//! not take are closed straight away.

use crate::core::error::Error;
use crate::core::types::ClientId;
use crate::executor::{Assignment, WorkerPool};
use crate::network::session::FileSession;
use crate::network::wait_for_shutdown;
use crate::system::metrics::Metrics;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Feeds accepted connections to the worker pool
pub struct Acceptor {
    listener: TcpListener,
    pool: Arc<WorkerPool<FileSession>>,
    metrics: Arc<Metrics>,
    next_client: u64,
}

impl Acceptor {
    /// Create an acceptor for `listener`
    pub fn new(listener: TcpListener, pool: Arc<WorkerPool<FileSession>>, metrics: Arc<Metrics>) -> Self {
        Self {
            listener,
            pool,
            metrics,
            next_client: 0,
        }
    }

    /// Accept until `shutdown` turns true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => match stream.into_std() {
                    Ok(stream) => self.dispatch(stream, addr),
                    Err(e) => warn!("Failed to detach connection from {}: {}", addr, e),
                },
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
        debug!("Acceptor stopped");
    }

    fn dispatch(&mut self, stream: TcpStream, addr: SocketAddr) {
        let client_id = ClientId::new(self.next_client);
        self.next_client += 1;
        let peer = addr.ip().to_string();

        if let Err(e) = stream.set_nonblocking(false) {
            warn!("[{}] Reject: {}", peer, e);
            self.metrics.connections.rejected.inc();
            return;
        }

        match self.pool.submit(Assignment::new(client_id, stream, peer.clone())) {
            Ok(task) => {
                info!("[{}] Accept", peer);
                debug!("Client {} assigned to worker {}", client_id, task);
                self.metrics.connections.accepted.inc();
            }
            Err(e) => {
                let e = Error::from(e);
                if e.is_connection_rejection() {
                    info!("[{}] Reject", peer);
                    debug!("Client {} connection dropped: {}", client_id, e);
                } else {
                    warn!("[{}] Reject: {}", peer, e);
                }
                self.metrics.connections.rejected.inc();
            }
        }
    }
}
