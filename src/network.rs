pub mod buffer;
pub mod listener;

pub use buffer::{ProxySocket, Readiness};
