//! Primary-channel sessions
//!
//! A session runs on a pool worker for the lifetime of one connection: greet
//! the client, then serve one request line at a time until the client leaves
//! or the pool shuts down. In adaptive mode every request first waits for the
//! client's tier to be released by the round coordinator.

use crate::core::app_state::AppState;
use crate::core::error::Result;
use crate::executor::{Assignment, ConnectionHandler, PoolStats, WorkerContext};
use crate::network::protocol::{self, Frame, LineFramer};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Serves file requests on accepted primary connections
pub struct FileSession {
    state: Arc<AppState>,
    adaptive_port: Option<u16>,
}

impl FileSession {
    /// Create a session handler. `adaptive_port` is announced in the greeting
    /// and enables round scheduling.
    pub fn new(state: Arc<AppState>, adaptive_port: Option<u16>) -> Self {
        Self {
            state,
            adaptive_port,
        }
    }

    fn run(&self, worker: &WorkerContext, assignment: &Assignment<TcpStream>) -> Result<()> {
        let Assignment {
            client_id,
            connection,
            peer,
        } = assignment;
        let network = &self.state.config.network;

        connection.set_read_timeout(Some(network.read_poll_interval))?;

        let mut writer = connection;
        writer.write_all(protocol::hello_line(*client_id, self.adaptive_port).as_bytes())?;

        let participation = self
            .adaptive_port
            .map(|_| self.state.coordinator.participate());
        let mut reader = BufReader::new(connection);
        let mut framer = LineFramer::new(network.max_line_length);

        loop {
            if worker.is_shutting_down() {
                debug!("Worker-{}: shutting down, closing client {}", worker.task_id(), client_id);
                return Ok(());
            }

            if let Some(participation) = &participation {
                if participation.schedule(*client_id).is_err() {
                    return Ok(());
                }
            }

            let frame = match read_polled(worker, &mut framer, &mut reader)? {
                Some(frame) => frame,
                None => return Ok(()),
            };

            match frame {
                Frame::Closed => {
                    info!("[{}] Disconnect", peer);
                    return Ok(());
                }
                Frame::Overlong => {
                    debug!("Worker-{}: illegal or corrupted client command", worker.task_id());
                    self.state.metrics.connections.requests_failed.inc();
                    writer.write_all(protocol::error_line(protocol::INTERNAL_ERROR).as_bytes())?;
                }
                Frame::Line(request) => {
                    trace!("Worker-{}: got input {:?} from client", worker.task_id(), request);
                    self.respond(&mut writer, &request)?;
                }
            }
        }
    }

    /// Answer one request line
    fn respond<W: Write>(&self, writer: &mut W, request: &str) -> Result<()> {
        let metrics = &self.state.metrics.connections;

        if protocol::contains_parent_path(request) {
            debug!("Parent path forbidden: {:?}", request);
            metrics.requests_failed.inc();
            writer.write_all(protocol::error_line(protocol::ILLEGAL_PATH).as_bytes())?;
            return Ok(());
        }

        let path = protocol::resolve_request(&self.state.config.server.directory, request);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                debug!("Open {} failed: {}", path.display(), err);
                metrics.requests_failed.inc();
                writer.write_all(protocol::error_line(&protocol::describe_io_error(&err)).as_bytes())?;
                return Ok(());
            }
        };

        let meta = file.metadata()?;
        if meta.is_dir() {
            metrics.requests_failed.inc();
            writer.write_all(protocol::error_line(protocol::IS_DIRECTORY).as_bytes())?;
            return Ok(());
        }

        let length = meta.len();
        writer.write_all(protocol::file_header(length).as_bytes())?;
        let sent = io::copy(&mut file.take(length), writer)?;
        if sent < length {
            // File shrank while sending; the client can not resync
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file truncated during transfer").into());
        }
        metrics.requests_served.inc();
        metrics.bytes_sent.inc_by(sent);
        trace!("Sent {} ({} bytes)", path.display(), sent);
        Ok(())
    }
}

/// Read a frame, checking for shutdown on each read timeout. `None` on shutdown.
fn read_polled<R: io::BufRead>(
    worker: &WorkerContext,
    framer: &mut LineFramer,
    reader: &mut R,
) -> io::Result<Option<Frame>> {
    loop {
        match framer.read_frame(reader) {
            Ok(frame) => return Ok(Some(frame)),
            Err(err) if is_timeout(&err) => {
                if worker.is_shutting_down() {
                    return Ok(None);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

impl ConnectionHandler for FileSession {
    type Connection = TcpStream;

    fn serve(&self, worker: &WorkerContext, assignment: Assignment<TcpStream>) {
        if let Err(err) = self.run(worker, &assignment) {
            debug!("Worker-{}: client {} dropped: {}", worker.task_id(), assignment.client_id, err);
        }
        self.state.metrics.connections.sessions_completed.inc();
        // Dropping the assignment closes the socket
    }

    fn pool_changed(&self, stats: &PoolStats) {
        self.state.metrics.observe_pool(stats);
    }
}
