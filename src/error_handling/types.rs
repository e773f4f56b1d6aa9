use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    MissingUpstreamPort,
    NotInRange(String),
    BadAddress(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::MissingUpstreamPort => write!(f, "Upstream server port is not set"),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::BadAddress(e) => write!(f, "Address formatting error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Failures of the readiness-aware socket primitives.
///
/// Every variant is fatal for the redirection direction that hit it, never
/// for the whole proxy.
#[derive(Debug)]
pub enum SocketError {
    /// A readiness wait was attempted on a socket this process already released.
    NotReadable(String),
    /// A single read filled the whole buffer; the frame may be truncated.
    FrameTooLarge { buffer_size: usize },
    /// A single write accepted fewer bytes than requested.
    PartialWrite { sent: usize, expected: usize },
    IoError(std::io::Error),
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::NotReadable(e) => write!(f, "Socket not ready to RECV: {}", e),
            SocketError::FrameTooLarge { buffer_size } => write!(
                f,
                "TCP RECV() filled the {} byte buffer and may not have captured the entire frame",
                buffer_size
            ),
            SocketError::PartialWrite { sent, expected } => {
                write!(f, "Not all bytes were sent ({} of {})", sent, expected)
            }
            SocketError::IoError(e) => write!(f, "Socket IO error: {}", e),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<std::io::Error> for SocketError {
    fn from(err: std::io::Error) -> Self {
        SocketError::IoError(err)
    }
}

#[derive(Debug)]
pub enum CaptureError {
    /// The log writer is gone; nothing will ever drain the queue again.
    QueueClosed,
    LogOpen(std::io::Error),
    LogWrite(std::io::Error),
    Encode(String),
    Decode(String),
    IoError(std::io::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::QueueClosed => write!(f, "Capture queue is closed"),
            CaptureError::LogOpen(e) => write!(f, "Unable to open replay log: {}", e),
            CaptureError::LogWrite(e) => write!(f, "Replay log write failed: {}", e),
            CaptureError::Encode(e) => write!(f, "Replay log encode error: {}", e),
            CaptureError::Decode(e) => write!(f, "Replay log decode error: {}", e),
            CaptureError::IoError(e) => write!(f, "Replay log IO error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err)
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    UpstreamResolve(String),
    UpstreamConnect(std::io::Error),
    SocketError(SocketError),
    CaptureError(CaptureError),
    TaskFailed(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::UpstreamResolve(e) => write!(f, "Upstream resolution failed: {}", e),
            ConnectionError::UpstreamConnect(e) => write!(f, "Upstream connect failed: {}", e),
            ConnectionError::SocketError(e) => write!(f, "Redirection error: {}", e),
            ConnectionError::CaptureError(e) => write!(f, "Capture error: {}", e),
            ConnectionError::TaskFailed(e) => write!(f, "Redirection task failed: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<SocketError> for ConnectionError {
    fn from(err: SocketError) -> Self {
        ConnectionError::SocketError(err)
    }
}

impl From<CaptureError> for ConnectionError {
    fn from(err: CaptureError) -> Self {
        ConnectionError::CaptureError(err)
    }
}

#[derive(Debug)]
pub enum ServerError {
    BindError(std::io::Error),
    LogWriter(CaptureError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::BindError(e) => write!(f, "Network bind error: {}", e),
            ServerError::LogWriter(e) => write!(f, "Log writer failed: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}
