//! Network layer
//!
//! The primary listener feeds the worker pool; in adaptive mode a second
//! listener collects speed reports over per-client side channels.

pub mod acceptor;
pub mod protocol;
pub mod server;
pub mod session;
pub mod side_channel;

pub use acceptor::Acceptor;
pub use server::{Server, ServerHandle};
pub use session::FileSession;
pub use side_channel::SideChannelListener;

use tokio::sync::watch;

/// Resolve once the shutdown flag is raised or its sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
