//! Readiness-aware RECV/SEND primitives.
//!
//! Both sockets of a connection are shared between its two redirection
//! directions, so every operation here works on `&ProxySocket` and relies on
//! tokio's readiness API (`readable`/`try_read`, `writable`/`try_write`)
//! rather than on owned read/write halves.
//!
//! A socket is "closed" once this process has released it through
//! [`ProxySocket::close`]. The direction reading from the *other* socket of
//! the pair uses that flag as a liveness proxy: while it waits for data it
//! re-checks the flag every poll interval and gives up when it is set.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::trace;
use socket2::SockRef;
use tokio::net::TcpStream;

use crate::error_handling::types::SocketError;

/// One side of a proxied connection.
#[derive(Debug)]
pub struct ProxySocket {
    stream: TcpStream,
    peer_addr: SocketAddr,
    closed: AtomicBool,
}

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The socket has data (or EOF) to read.
    Ready,
    /// The socket on the other end of the pair has been closed.
    Closed,
}

impl ProxySocket {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether this process already released the socket.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Releases the socket: both directions of the TCP connection are shut
    /// down so the peer observes EOF. Calling it again is a no-op.
    ///
    /// The descriptor itself is freed when the last owner drops the socket.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            // The peer may have reset the connection already.
            trace!("shutdown of {} failed: {}", self.peer_addr, e);
        }
    }
}

/// Waits until `recv_socket` is readable.
///
/// Readiness is re-checked every `poll_interval`; between checks, a closed
/// `send_socket` ends the wait with [`Readiness::Closed`] so a dead peer
/// never keeps this direction blocked.
pub async fn wait_readable(
    recv_socket: &ProxySocket,
    send_socket: &ProxySocket,
    poll_interval: Duration,
) -> Result<Readiness, SocketError> {
    if recv_socket.is_closed() {
        return Err(SocketError::NotReadable(format!(
            "{} was already released",
            recv_socket.peer_addr
        )));
    }

    loop {
        match tokio::time::timeout(poll_interval, recv_socket.stream.readable()).await {
            Ok(ready) => {
                ready?;
                return Ok(Readiness::Ready);
            }
            Err(_elapsed) => {
                if send_socket.is_closed() {
                    return Ok(Readiness::Closed);
                }
            }
        }
    }
}

/// Performs a single RECV of up to `buf.len()` bytes.
///
/// Returns an empty slice at end of stream, including when `send_socket` was
/// closed while waiting. A read that fills the whole buffer is rejected with
/// [`SocketError::FrameTooLarge`]: frames are never reassembled from several
/// reads.
pub async fn recv<'b>(
    recv_socket: &ProxySocket,
    send_socket: &ProxySocket,
    buf: &'b mut [u8],
    poll_interval: Duration,
) -> Result<&'b [u8], SocketError> {
    let buffer_size = buf.len();
    loop {
        if wait_readable(recv_socket, send_socket, poll_interval).await? == Readiness::Closed {
            return Ok(&buf[..0]);
        }

        match recv_socket.stream.try_read(buf) {
            Ok(n) if n == buffer_size => {
                return Err(SocketError::FrameTooLarge { buffer_size });
            }
            Ok(n) => return Ok(&buf[..n]),
            // Spurious wake-up, go back to waiting.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(SocketError::IoError(e)),
        }
    }
}

/// Performs a single SEND of the whole `chunk`.
///
/// Accepting fewer bytes than requested is a [`SocketError::PartialWrite`];
/// there is no retry of the remainder.
pub async fn send(send_socket: &ProxySocket, chunk: &[u8]) -> Result<(), SocketError> {
    loop {
        send_socket.stream.writable().await?;

        match send_socket.stream.try_write(chunk) {
            Ok(n) if n == chunk.len() => return Ok(()),
            Ok(n) => {
                return Err(SocketError::PartialWrite {
                    sent: n,
                    expected: chunk.len(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(SocketError::IoError(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    const POLL: Duration = Duration::from_millis(10);

    /// Returns `(proxy_side, outside)` connected over loopback.
    pub(crate) async fn tcp_pair() -> std::io::Result<(TcpStream, TcpStream)> {
        let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (server_side, _) = listener.accept().await?;
        let client = client.await.unwrap()?;
        Ok((server_side, client))
    }

    async fn proxy_socket_pair() -> (ProxySocket, TcpStream) {
        let (inside, outside) = tcp_pair().await.unwrap();
        let peer = inside.peer_addr().unwrap();
        (ProxySocket::new(inside, peer), outside)
    }

    #[tokio::test]
    async fn recv_returns_available_chunk() {
        let (a, mut a_out) = proxy_socket_pair().await;
        let (b, _b_out) = proxy_socket_pair().await;

        a_out.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 64];
        let chunk = assert_ok!(recv(&a, &b, &mut buf, POLL).await);
        assert_eq!(chunk, b"hello");
    }

    #[tokio::test]
    async fn recv_returns_empty_on_peer_half_close() {
        let (a, mut a_out) = proxy_socket_pair().await;
        let (b, _b_out) = proxy_socket_pair().await;

        a_out.shutdown().await.unwrap();

        let mut buf = [0u8; 64];
        let chunk = assert_ok!(recv(&a, &b, &mut buf, POLL).await);
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn recv_gives_up_when_other_end_is_closed() {
        let (a, _a_out) = proxy_socket_pair().await;
        let (b, _b_out) = proxy_socket_pair().await;

        b.close();

        let mut buf = [0u8; 64];
        let chunk = tokio::time::timeout(Duration::from_secs(2), recv(&a, &b, &mut buf, POLL))
            .await
            .expect("recv did not notice the closed socket")
            .unwrap();
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn recv_rejects_full_buffer_reads() {
        let (a, mut a_out) = proxy_socket_pair().await;
        let (b, _b_out) = proxy_socket_pair().await;

        a_out.write_all(b"12345678").await.unwrap();

        let mut buf = [0u8; 8];
        let err = recv(&a, &b, &mut buf, POLL).await.unwrap_err();
        assert!(matches!(err, SocketError::FrameTooLarge { buffer_size: 8 }));
    }

    #[tokio::test]
    async fn wait_readable_on_released_socket_is_usage_error() {
        let (a, _a_out) = proxy_socket_pair().await;
        let (b, _b_out) = proxy_socket_pair().await;

        a.close();
        assert!(a.is_closed());

        let err = wait_readable(&a, &b, POLL).await.unwrap_err();
        assert!(matches!(err, SocketError::NotReadable(_)));
    }

    #[tokio::test]
    async fn send_delivers_whole_chunk() {
        let (a, mut a_out) = proxy_socket_pair().await;

        assert_ok!(send(&a, b"world").await);

        let mut buf = [0u8; 16];
        let n = a_out.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn send_larger_than_socket_buffers_is_partial_write() {
        let (a, a_out) = proxy_socket_pair().await;
        SockRef::from(&a.stream).set_send_buffer_size(4096).unwrap();
        SockRef::from(&a_out).set_recv_buffer_size(4096).unwrap();

        // Nobody reads on the other side, so the kernel takes only part of it.
        let chunk = vec![0x5a; 4 * 1024 * 1024];
        let err = send(&a, &chunk).await.unwrap_err();
        match err {
            SocketError::PartialWrite { sent, expected } => {
                assert!(sent > 0 && sent < expected);
                assert_eq!(expected, chunk.len());
            }
            other => panic!("expected a partial write, got {:?}", other),
        }
        drop(a_out);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_signals_eof() {
        let (a, mut a_out) = proxy_socket_pair().await;

        a.close();
        a.close();

        let mut buf = [0u8; 16];
        let n = a_out.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
