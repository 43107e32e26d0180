//! Adaptive side-channel listener
//!
//! Every adaptive client opens a second connection that carries only its pan
//! speed. The first line is the client id (answered with `OK`), every later
//! line a new speed. All side channels are multiplexed on the async runtime,
//! one lightweight task per channel.

use crate::core::app_state::AppState;
use crate::core::error::{ProtocolError, Result};
use crate::core::types::{ClientId, SideChannelId};
use crate::network::protocol::{self, Frame, LineFramer};
use crate::network::wait_for_shutdown;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

/// Accepts side channels and turns their reports into registry updates
pub struct SideChannelListener {
    listener: TcpListener,
    state: Arc<AppState>,
    next_channel: u64,
}

impl SideChannelListener {
    /// Create a listener sharing `state`'s registry and coordinator
    pub fn new(listener: TcpListener, state: Arc<AppState>) -> Self {
        Self {
            listener,
            state,
            next_channel: 0,
        }
    }

    /// Serve side channels until `shutdown` turns true, then drop them all
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut channels = JoinSet::new();

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        self.next_channel += 1;
                        let channel = SideChannelId::new(self.next_channel);
                        trace!("Adaptive: side channel {} from {}", channel, addr);
                        channels.spawn(serve_channel(Arc::clone(&self.state), stream, channel, shutdown.clone()));
                    }
                    Err(e) => warn!("Adaptive: accept failed: {}", e),
                },
                Some(finished) = channels.join_next(), if !channels.is_empty() => {
                    if let Err(e) = finished {
                        error!("Adaptive: side channel task failed: {}", e);
                    }
                }
            }
        }

        debug!("Adaptive: shutting down scheduler, closing {} side channels", channels.len());
        channels.shutdown().await;
    }
}

/// Drive one side channel from handshake to disconnect
async fn serve_channel(
    state: Arc<AppState>,
    stream: TcpStream,
    channel: SideChannelId,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut framer = LineFramer::new(state.config.network.max_line_length);

    let client_id = match handshake(&state, &mut framer, &mut reader).await {
        Ok(client_id) => client_id,
        Err(e) => {
            if e.is_client_error() {
                debug!("Adaptive: discarding side channel {}: {}", channel, e);
            } else {
                warn!("Adaptive: side channel {} failed: {}", channel, e);
            }
            state.metrics.scheduler.handshakes_rejected.inc();
            return;
        }
    };

    register(&state, client_id, channel);

    if let Err(e) = write.write_all(protocol::HANDSHAKE_OK).await {
        debug!("Adaptive: client {} handshake failed on response: {}", client_id, e);
        disconnect(&state, client_id, channel);
        return;
    }

    loop {
        let frame = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return,
            frame = framer.read_frame_async(&mut reader) => frame,
        };

        match frame {
            Ok(Frame::Line(line)) => apply_speed(&state, client_id, &line),
            Ok(Frame::Overlong) => {
                debug!("Adaptive: malformed speed update from client {}", client_id);
                state.metrics.record_speed_update(false);
            }
            Ok(Frame::Closed) => break,
            Err(e) => {
                debug!("Adaptive: recv from client {}: {}", client_id, e);
                break;
            }
        }
    }

    disconnect(&state, client_id, channel);
}

async fn handshake(
    state: &AppState,
    framer: &mut LineFramer,
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<ClientId> {
    let frame = timeout(state.config.network.handshake_timeout, framer.read_frame_async(reader))
        .await
        .map_err(|_| ProtocolError::MalformedHandshake("timed out".to_string()))??;

    match frame {
        Frame::Line(line) => Ok(protocol::parse_client_id(&line)?),
        Frame::Overlong => Err(ProtocolError::MalformedHandshake("line too long".to_string()).into()),
        Frame::Closed => Err(ProtocolError::MalformedHandshake("disconnected before sending an id".to_string()).into()),
    }
}

fn register(state: &AppState, client_id: ClientId, channel: SideChannelId) {
    // A repeated handshake starts the client over at the lowest speed
    let rank = state.registry.upsert(client_id, 1);
    if let Err(e) = state.registry.attach_channel(client_id, channel) {
        // Removed between the two calls; it ranks last until it reports again
        warn!("Adaptive: {}", e);
    }
    state.metrics.scheduler.handshakes.inc();
    state.metrics.scheduler.registered_clients.set(state.registry.len() as i64);
    debug!("Adaptive: client {} registered on channel {} at rank {}", client_id, channel, rank);
}

fn apply_speed(state: &AppState, client_id: ClientId, line: &str) {
    match protocol::parse_speed(line) {
        Ok(speed) => {
            let rank = state.registry.upsert(client_id, speed);
            state.metrics.record_speed_update(true);
            trace!("Adaptive: client {} speed {} now rank {}", client_id, speed, rank);
        }
        Err(e) => {
            debug!("Adaptive: invalid speed update from client {}: {}", client_id, e);
            state.metrics.record_speed_update(false);
        }
    }
}

/// Drop the client's ranking. Round membership belongs to the primary session,
/// which leaves the round itself when its connection ends.
fn disconnect(state: &AppState, client_id: ClientId, channel: SideChannelId) {
    debug!("Adaptive: client {} disconnected", client_id);
    if state.registry.remove_channel(client_id, channel).is_some() {
        let cutoffs = state.registry.recompute_cutoffs();
        trace!("Adaptive: cutoffs now {:?}", cutoffs);
    }
    state.metrics.scheduler.registered_clients.set(state.registry.len() as i64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::types::Tier;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::AsyncBufReadExt;

    async fn start() -> (SocketAddr, Arc<AppState>, watch::Sender<bool>) {
        let mut config = Config::default();
        config.network.handshake_timeout = Duration::from_millis(200);
        let state = Arc::new(AppState::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(SideChannelListener::new(listener, Arc::clone(&state)).run(rx));
        (addr, state, tx)
    }

    async fn connect(addr: SocketAddr, client: u64) -> tokio::io::BufReader<TcpStream> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(format!("{}\n", client).as_bytes()).await.unwrap();
        let mut reader = tokio::io::BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "OK\n");
        reader
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn speeds(state: &AppState) -> Vec<(u64, u64)> {
        state
            .registry
            .snapshot()
            .iter()
            .map(|e| (e.client_id.get(), e.speed))
            .collect()
    }

    #[tokio::test]
    async fn test_handshake_then_speed_updates() {
        let (addr, state, _tx) = start().await;

        let mut first = connect(addr, 1).await;
        let mut second = connect(addr, 2).await;
        assert_eq!(speeds(&state), vec![(1, 1), (2, 1)]);

        first.get_mut().write_all(b"9\n").await.unwrap();
        second.get_mut().write_all(b"0\n").await.unwrap();
        eventually(|| speeds(&state) == vec![(2, 1), (1, 9)]).await;
        assert_eq!(state.registry.placement(ClientId::new(2)).1, Tier::High);
    }

    #[tokio::test]
    async fn test_malformed_update_keeps_channel() {
        let (addr, state, _tx) = start().await;
        let mut client = connect(addr, 5).await;

        client.get_mut().write_all(b"fast\n").await.unwrap();
        client.get_mut().write_all(b"4\n").await.unwrap();
        eventually(|| speeds(&state) == vec![(5, 4)]).await;
        let text = state.metrics.render().unwrap();
        assert!(text.contains("result=\"malformed\"} 1"));
    }

    #[tokio::test]
    async fn test_disconnect_removes_client() {
        let (addr, state, _tx) = start().await;
        let first = connect(addr, 1).await;
        let _second = connect(addr, 2).await;
        assert_eq!(state.registry.len(), 2);

        drop(first);
        eventually(|| speeds(&state) == vec![(2, 1)]).await;
        assert_eq!(state.registry.cutoffs().high, 1);
        assert_eq!(state.registry.cutoffs().medium, 1);
    }

    #[tokio::test]
    async fn test_rehandshake_survives_old_channel_closing() {
        let (addr, state, _tx) = start().await;
        let old = connect(addr, 7).await;
        let mut newer = connect(addr, 7).await;
        newer.get_mut().write_all(b"3\n").await.unwrap();
        eventually(|| speeds(&state) == vec![(7, 3)]).await;

        drop(old);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(speeds(&state), vec![(7, 3)]);
    }

    #[tokio::test]
    async fn test_bad_handshakes_are_dropped() {
        let (addr, state, _tx) = start().await;

        let mut garbage = TcpStream::connect(addr).await.unwrap();
        garbage.write_all(b"hello\n").await.unwrap();
        let mut buf = Vec::new();
        let read = tokio::io::AsyncReadExt::read_to_end(&mut garbage, &mut buf).await;
        assert!(read.is_err() || buf.is_empty());

        // Silent client is dropped after the handshake timeout
        let mut silent = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let read = tokio::io::AsyncReadExt::read_to_end(&mut silent, &mut buf).await;
        assert!(read.is_err() || buf.is_empty());

        assert!(state.registry.is_empty());
        eventually(|| state.metrics.scheduler.handshakes_rejected.get() == 2).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels() {
        let (addr, state, tx) = start().await;
        let mut client = connect(addr, 1).await;

        tx.send(true).unwrap();
        let mut line = String::new();
        let read = client.read_line(&mut line).await;
        assert!(matches!(read, Ok(0)) || read.is_err());
        // Shutdown leaves registrations alone
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_side_channel_loss_leaves_round_to_primary_session() {
        let (addr, state, _tx) = start().await;
        let _first = connect(addr, 1).await;
        let second = connect(addr, 2).await;

        // Both primary sessions take part; client 1 waits for client 2 to check in
        let coordinator = Arc::clone(&state.coordinator);
        coordinator.expect_me();
        coordinator.expect_me();
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            std::thread::spawn(move || coordinator.schedule_me(ClientId::new(1)))
        };
        eventually(|| coordinator.snapshot().checked_in == 1).await;
        let pending = coordinator.snapshot();

        drop(second);
        eventually(|| state.registry.len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.snapshot(), pending);
        assert!(!waiter.is_finished());

        // Client 2's primary session ends and completes the round
        coordinator.unexpect_me();
        let scheduled = tokio::task::spawn_blocking(move || waiter.join().unwrap())
            .await
            .unwrap();
        assert_eq!(scheduled, Ok(Tier::High));
    }
}
