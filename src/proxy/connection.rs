//! Per-connection handling: dial the upstream and redirect both directions.
//!
//! Each accepted client gets a `ConnectionHandler` that connects to the
//! upstream and then runs two redirection tasks in a `JoinSet`:
//!
//! - client → server: every chunk read is pushed to the capture queue, then
//!   forwarded. A full queue makes this direction wait (backpressure).
//! - server → client: forwarded only, nothing is captured.
//!
//! A direction ends on end of stream, when it sees the other socket of the
//! pair closed, or on the first error. Whatever the reason, it then closes
//! the socket it reads from, which in turn lets the opposite direction end.
//! One direction finishing never cancels the other one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::net::{lookup_host, TcpStream};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::configuration::Config;
use crate::data_capture::queue::CaptureSender;
use crate::data_capture::types::{CaptureEntry, ConnectionId, Direction};
use crate::error_handling::types::ConnectionError;
use crate::network::buffer::{self, ProxySocket};

use super::status::StatusSink;

/// What every connection needs to know about where and how to proxy.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub server_host: String,
    pub server_port: u16,
    pub buffer_size: usize,
    pub poll_interval: Duration,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            server_host: config.server_host.clone(),
            server_port: config.server_port,
            buffer_size: config.buffer_size,
            poll_interval: config.poll_interval(),
        }
    }
}

/// Traffic that went through one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub chunks: u64,
    pub bytes: u64,
}

/// Outcome of a connection where both directions ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub connection: ConnectionId,
    pub client_to_server: DirectionStats,
    pub server_to_client: DirectionStats,
}

pub struct ConnectionHandler {
    id: Uuid,
    settings: Arc<ConnectionSettings>,
    capture: CaptureSender,
    sink: Arc<dyn StatusSink>,
}

impl ConnectionHandler {
    pub fn new(
        settings: Arc<ConnectionSettings>,
        capture: CaptureSender,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            settings,
            capture,
            sink,
        }
    }

    /// Proxies `client` until both directions are done.
    ///
    /// Failures are reported to the status sink before being returned; they
    /// only ever concern this connection.
    pub async fn handle(
        self,
        client: TcpStream,
        client_addr: SocketAddr,
    ) -> Result<ConnectionSummary, ConnectionError> {
        let result = self.proxy(client, client_addr).await;
        if let Err(ref e) = result {
            self.sink
                .display(&format!("Connection from {} failed: {}", client_addr, e));
        }
        result
    }

    async fn proxy(
        &self,
        client: TcpStream,
        client_addr: SocketAddr,
    ) -> Result<ConnectionSummary, ConnectionError> {
        let (server, server_addr) = self.connect_upstream().await?;
        let connection = ConnectionId::new(client_addr, server_addr);
        debug!("[{}] proxying {}", self.id, connection);

        let client = Arc::new(ProxySocket::new(client, client_addr));
        let server = Arc::new(ProxySocket::new(server, server_addr));

        let mut set = JoinSet::new();
        set.spawn(self.redirection(
            Arc::clone(&client),
            Arc::clone(&server),
            connection,
            Direction::ClientToServer,
        ));
        set.spawn(self.redirection(
            Arc::clone(&server),
            Arc::clone(&client),
            connection,
            Direction::ServerToClient,
        ));

        let mut client_to_server = DirectionStats::default();
        let mut server_to_client = DirectionStats::default();
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined
                .map_err(|e| ConnectionError::TaskFailed(e.to_string()))
                .and_then(|r| r);
            match outcome {
                Ok((Direction::ClientToServer, stats)) => client_to_server = stats,
                Ok((Direction::ServerToClient, stats)) => server_to_client = stats,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        // A panicking task never ran its close; make sure nothing stays open.
        client.close();
        server.close();

        trace!("[{}] connection {} completed", self.id, connection);
        match first_error {
            Some(e) => Err(e),
            None => Ok(ConnectionSummary {
                connection,
                client_to_server,
                server_to_client,
            }),
        }
    }

    /// Dials the addresses the upstream host resolves to, in order, and
    /// keeps the first one that accepts.
    async fn connect_upstream(&self) -> Result<(TcpStream, SocketAddr), ConnectionError> {
        let host = (self.settings.server_host.as_str(), self.settings.server_port);
        let addrs = lookup_host(host)
            .await
            .map_err(|e| ConnectionError::UpstreamResolve(e.to_string()))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok((stream, addr)),
                Err(e) => {
                    debug!("[{}] upstream {} refused: {}", self.id, addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => ConnectionError::UpstreamConnect(e),
            None => ConnectionError::UpstreamResolve(format!(
                "{}:{} did not resolve to any address",
                self.settings.server_host, self.settings.server_port
            )),
        })
    }

    fn redirection(
        &self,
        recv_socket: Arc<ProxySocket>,
        send_socket: Arc<ProxySocket>,
        connection: ConnectionId,
        direction: Direction,
    ) -> impl std::future::Future<Output = Result<(Direction, DirectionStats), ConnectionError>>
           + Send
           + 'static {
        let redirect = Redirect {
            id: self.id,
            description: connection.describe(direction),
            connection,
            capture: direction.is_captured().then(|| self.capture.clone()),
            buffer_size: self.settings.buffer_size,
            poll_interval: self.settings.poll_interval,
        };
        let sink = Arc::clone(&self.sink);

        async move {
            let result = redirect.run(&recv_socket, &send_socket).await;
            match result {
                Ok(stats) => {
                    sink.display(&format!(
                        "Done redirecting socket for {}",
                        redirect.description
                    ));
                    Ok((direction, stats))
                }
                Err(e) => {
                    warn!("[{}] {} failed: {}", redirect.id, redirect.description, e);
                    Err(e)
                }
            }
        }
    }
}

/// One direction of a connection.
struct Redirect {
    id: Uuid,
    description: String,
    connection: ConnectionId,
    /// Set for the direction whose chunks are recorded.
    capture: Option<CaptureSender>,
    buffer_size: usize,
    poll_interval: Duration,
}

impl Redirect {
    async fn run(
        &self,
        recv_socket: &ProxySocket,
        send_socket: &ProxySocket,
    ) -> Result<DirectionStats, ConnectionError> {
        let _close = CloseOnDrop(recv_socket);
        trace!("[{}] {} started", self.id, self.description);

        let mut stats = DirectionStats::default();
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let chunk =
                buffer::recv(recv_socket, send_socket, &mut buf, self.poll_interval).await?;
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len();

            if let Some(ref capture) = self.capture {
                capture
                    .push(CaptureEntry::new(self.connection, chunk.to_vec()))
                    .await?;
            }
            buffer::send(send_socket, chunk).await?;

            stats.chunks += 1;
            stats.bytes += n as u64;
            let preview = &chunk[..std::cmp::min(n, 64)];
            trace!(
                "[{}] {} forwarded {} bytes: {}{}",
                self.id,
                self.description,
                n,
                String::from_utf8_lossy(preview),
                if n > 64 { " ..." } else { "" }
            );
        }

        trace!(
            "[{}] {} EOF after {} chunks",
            self.id,
            self.description,
            stats.chunks
        );
        Ok(stats)
    }
}

/// Closes the read side of a direction however the direction ends.
struct CloseOnDrop<'a>(&'a ProxySocket);

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}
