use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::error_handling::types::ServerError;

/// Creates the listening socket of the proxy with `SO_REUSEADDR` set.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(ServerError::BindError)?;

    socket.set_reuseaddr(true).map_err(ServerError::BindError)?;
    socket.bind(addr).map_err(ServerError::BindError)?;
    let listener = socket.listen(backlog).map_err(ServerError::BindError)?;

    debug!("Listening socket bound to {} (backlog {})", addr, backlog);
    Ok(listener)
}

/// Turns on TCP keepalive for an accepted connection.
///
/// Failures are only logged: a connection without keepalive still proxies.
pub fn set_keepalive(stream: &TcpStream, interval: Duration) {
    let keepalive = TcpKeepalive::new().with_time(interval);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keepalive: {}", e);
    }
}

/// Waits for the next inbound connection and prepares it for proxying.
pub async fn accept(
    listener: &TcpListener,
    keepalive_interval: Duration,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await?;
    set_keepalive(&stream, keepalive_interval);
    Ok((stream, addr))
}
