//! Common data types used across the data_capture subsystem.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Direction of TCP flow through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Bytes flowing from the downstream client to the upstream server.
    ClientToServer,
    /// Bytes flowing from the upstream server back to the client.
    ServerToClient,
}

impl Direction {
    /// Only the bytes sent toward the upstream end up in the replay log.
    pub fn is_captured(self) -> bool {
        matches!(self, Direction::ClientToServer)
    }
}

/// Identity of a proxied connection: who connected, and where it was forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId {
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl ConnectionId {
    pub fn new(client: SocketAddr, server: SocketAddr) -> Self {
        Self { client, server }
    }

    /// Human-readable description of one redirection direction.
    pub fn describe(&self, direction: Direction) -> String {
        match direction {
            Direction::ClientToServer => {
                format!("client({})->proxy->server({})", self.client, self.server)
            }
            Direction::ServerToClient => {
                format!("server({})->proxy->client({})", self.server, self.client)
            }
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.client, self.server)
    }
}

/// One chunk forwarded toward the upstream, as it is committed to the replay log.
///
/// Entries are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureEntry {
    timestamp: DateTime<Utc>,
    connection: ConnectionId,
    payload: Vec<u8>,
}

impl CaptureEntry {
    /// Stamps `payload` with the current time.
    pub fn new(connection: ConnectionId, payload: Vec<u8>) -> Self {
        Self::from_parts(Utc::now(), connection, payload)
    }

    pub fn from_parts(timestamp: DateTime<Utc>, connection: ConnectionId, payload: Vec<u8>) -> Self {
        Self {
            timestamp,
            connection,
            payload,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
