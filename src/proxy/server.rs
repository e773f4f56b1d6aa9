//! # Proxy Server
//!
//! Owns the listening socket and the log writer, accepts connections until an
//! interrupt arrives, and then drains.
//!
//! ```text
//! Init ─▶ Listening ─▶ Accepting ⇄ Dispatching ─▶ Draining ─▶ Stopped
//!                          ▲            │
//!                          └────────────┘   one task per connection
//! ```
//!
//! Draining stops accepting, waits for every dispatched connection to finish
//! on its own, sets the completion signal and then waits for the log writer
//! to flush what is left. Nothing in flight is cancelled.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tcp_replay_proxy::configuration::Config;
//! use tcp_replay_proxy::proxy::{LogSink, ProxyServer};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config { server_port: 5432, ..Default::default() };
//! let server = ProxyServer::bind(config, Arc::new(LogSink)).await?;
//! let report = server
//!     .run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! println!("{} entries captured", report.entries_written);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::configuration::Config;
use crate::data_capture::log_writer::{LogWriter, WriterFailure};
use crate::data_capture::queue::{capture_queue, CaptureReceiver, CaptureSender, CompletionSignal};
use crate::error_handling::types::{CaptureError, ConnectionError, ServerError};
use crate::network::listener;

use super::connection::{ConnectionHandler, ConnectionSettings, ConnectionSummary};
use super::status::StatusSink;

/// Pause after a failed accept. Errors such as `EMFILE` leave the pending
/// connection in the backlog, so retrying at once would spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    Listening,
    Accepting,
    Dispatching,
    Draining,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Init => "init",
            ServerState::Listening => "listening",
            ServerState::Accepting => "accepting",
            ServerState::Dispatching => "dispatching",
            ServerState::Draining => "draining",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What happened during the lifetime of a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerReport {
    pub connections_accepted: u64,
    pub connections_failed: u64,
    pub entries_written: u64,
}

pub struct ProxyServer {
    config: Config,
    listener: TcpListener,
    local_addr: SocketAddr,
    capture: CaptureSender,
    completion: Arc<CompletionSignal>,
    log_writer: JoinHandle<Result<u64, WriterFailure>>,
    sink: Arc<dyn StatusSink>,
    state: watch::Sender<ServerState>,
}

impl ProxyServer {
    /// Binds the listening socket and starts the log writer.
    pub async fn bind(config: Config, sink: Arc<dyn StatusSink>) -> Result<Self, ServerError> {
        let (state, _) = watch::channel(ServerState::Init);

        let addr = SocketAddr::new(config.bind_address, config.proxy_port);
        let listener = listener::bind_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr().map_err(ServerError::BindError)?;

        let (capture, receiver) = capture_queue(config.queue_capacity);
        let completion = Arc::new(CompletionSignal::new());
        let writer = LogWriter::create(
            &config.replay_log,
            receiver,
            Arc::clone(&completion),
            config.queue_pop_timeout(),
        )
        .await
        .map_err(ServerError::LogWriter)?;
        let log_writer = tokio::spawn(writer.run());

        sink.display(&format!(
            "Starting tcp-replay-proxy proxy server on port {}\n  Proxying server located at {}",
            local_addr.port(),
            config.upstream()
        ));

        Ok(Self {
            config,
            listener,
            local_addr,
            capture,
            completion,
            log_writer,
            sink,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Observes the state machine; the receiver outlives the server.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Accepts connections until `shutdown` resolves, then drains.
    ///
    /// Returns an error only when the log writer failed: captured data was
    /// lost and the process should exit with a failure status.
    pub async fn run<F>(self, shutdown: F) -> Result<ServerReport, ServerError>
    where
        F: Future<Output = ()>,
    {
        let ProxyServer {
            config,
            listener,
            local_addr,
            capture,
            completion,
            mut log_writer,
            sink,
            state,
        } = self;

        let settings = Arc::new(ConnectionSettings::from(&config));
        let keepalive = config.keepalive_interval();
        let mut report = ServerReport::default();
        let mut connections = JoinSet::new();
        let mut writer_result: Option<Result<u64, CaptureError>> = None;
        let mut stalled_queue: Option<CaptureReceiver> = None;

        enter(&state, ServerState::Listening);
        tokio::pin!(shutdown);

        loop {
            enter(&state, ServerState::Accepting);
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                joined = &mut log_writer, if writer_result.is_none() => {
                    let (result, queue) = writer_outcome(joined);
                    report_writer_failure(&*sink, &result);
                    // Producers keep filling the queue, then wait on it.
                    stalled_queue = queue;
                    writer_result = Some(result);
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    record_connection(&mut report, joined);
                }

                accepted = listener::accept(&listener, keepalive) => match accepted {
                    Ok((stream, client_addr)) => {
                        report.connections_accepted += 1;
                        sink.display(&format!("Accepted connection from {}", client_addr));

                        enter(&state, ServerState::Dispatching);
                        let handler = ConnectionHandler::new(
                            Arc::clone(&settings),
                            capture.clone(),
                            Arc::clone(&sink),
                        );
                        connections.spawn(handler.handle(stream, client_addr));
                    }
                    Err(e) => accept_failed(&*sink, &e).await,
                },
            }
        }

        drop(listener);
        enter(&state, ServerState::Draining);
        sink.display(&format!(
            "Stopping tcp-replay-proxy proxy server on port {}",
            local_addr.port()
        ));
        sink.display("Waiting for request handlers to complete...");
        // Handlers keep their own clones until they are done.
        drop(capture);
        if stalled_queue.take().is_some() {
            sink.display("Releasing connections stalled on the capture queue");
        }

        loop {
            tokio::select! {
                joined = connections.join_next() => match joined {
                    Some(joined) => record_connection(&mut report, joined),
                    None => break,
                },
                joined = &mut log_writer, if writer_result.is_none() => {
                    // Dropping the queue here lets stalled handlers finish.
                    let (result, _queue) = writer_outcome(joined);
                    report_writer_failure(&*sink, &result);
                    writer_result = Some(result);
                }
            }
        }
        // Only set once no handler can push anymore.
        completion.set();

        let writer_result = match writer_result {
            Some(result) => result,
            None => writer_outcome(log_writer.await).0,
        };

        enter(&state, ServerState::Stopped);
        match writer_result {
            Ok(written) => {
                report.entries_written = written;
                sink.display(&format!(
                    "Proxy server stopped: {} connection(s), {} captured chunk(s) written",
                    report.connections_accepted, written
                ));
                Ok(report)
            }
            Err(e) => {
                sink.display(&format!("Proxy server stopped, replay log is incomplete: {}", e));
                Err(ServerError::LogWriter(e))
            }
        }
    }
}

fn enter(state: &watch::Sender<ServerState>, next: ServerState) {
    let previous = state.send_replace(next);
    if previous != next {
        trace!("server state {} -> {}", previous, next);
    }
}

/// Splits a finished writer into its result and, after a write failure, the
/// queue nobody drains anymore.
fn writer_outcome(
    joined: Result<Result<u64, WriterFailure>, JoinError>,
) -> (Result<u64, CaptureError>, Option<CaptureReceiver>) {
    match joined {
        Ok(Ok(written)) => (Ok(written), None),
        Ok(Err(failure)) => (Err(failure.error), Some(failure.queue)),
        Err(e) => (
            Err(CaptureError::LogWrite(io::Error::new(
                io::ErrorKind::Other,
                format!("log writer task failed: {}", e),
            ))),
            None,
        ),
    }
}

fn report_writer_failure(sink: &dyn StatusSink, result: &Result<u64, CaptureError>) {
    if let Err(e) = result {
        error!("Log writer stopped: {}", e);
        sink.display(&format!("Log writer failed, capture is stalled: {}", e));
    }
}

async fn accept_failed(sink: &dyn StatusSink, error: &io::Error) {
    sink.display(&format!("Failed to accept connection: {}", error));
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

fn record_connection(
    report: &mut ServerReport,
    joined: Result<Result<ConnectionSummary, ConnectionError>, JoinError>,
) {
    match joined {
        Ok(Ok(summary)) => debug!(
            "Connection {} finished: {} chunk(s) upstream, {} chunk(s) downstream",
            summary.connection, summary.client_to_server.chunks, summary.server_to_client.chunks
        ),
        // Already reported by the handler.
        Ok(Err(_)) => report.connections_failed += 1,
        Err(e) => {
            error!("Connection task failed: {}", e);
            report.connections_failed += 1;
        }
    }
}
