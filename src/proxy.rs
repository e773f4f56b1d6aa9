pub mod connection;
pub mod server;
pub mod status;

pub use connection::{ConnectionHandler, ConnectionSettings, ConnectionSummary};
pub use server::{ProxyServer, ServerReport, ServerState};
pub use status::{LogSink, StatusSink};
