use std::net::{IpAddr, Ipv4Addr};

/// Address the proxy listens on unless told otherwise.
pub const DEFAULT_PROXY_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_SERVER_HOST: &str = "localhost";
pub const DEFAULT_REPLAY_LOG: &str = "replay.bin";

pub const DEFAULT_BACKLOG: u32 = 5;
/// 3 minutes.
pub const DEFAULT_KEEP_ALIVE_INTERVAL_SECS: u64 = 180;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_BUFFER_SIZE: usize = 0x10000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
pub const DEFAULT_QUEUE_POP_TIMEOUT_MS: u64 = 2000;
