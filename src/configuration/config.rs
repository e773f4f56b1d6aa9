use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Args;
use log::debug;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration of the capturing proxy.
///
/// The configuration can come from a TOML file (every key optional, missing
/// keys take their defaults) and is then overridden by command-line flags,
/// see [`ServeArgs`].
///
/// # Example file
///
/// ```toml
/// proxy_port = 5433
/// server_host = "127.0.0.1"
/// server_port = 5432
/// replay_log = "/var/lib/proxy/replay.bin"
/// ```
///
/// # Fields Overview
///
/// - `bind_address` / `proxy_port`: where the proxy listens (`0` = ephemeral port)
/// - `server_host` / `server_port`: the upstream every connection is forwarded to
/// - `replay_log`: file receiving the binary capture frames (truncated on start)
/// - `buffer_size`: size of a single RECV; a read filling it is treated as a truncated frame
/// - `queue_capacity`: bound of the capture queue, producers wait when it is full
/// - `keepalive_interval_secs`, `backlog`: accepted/listening socket tuning
/// - `poll_interval_ms`: readiness re-check interval while waiting to RECV
/// - `queue_pop_timeout_ms`: how long the log writer waits for an entry before
///   re-checking whether the proxy is shutting down
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind_address: IpAddr,
    pub proxy_port: u16,
    pub server_host: String,
    pub server_port: u16,
    pub replay_log: PathBuf,
    pub buffer_size: usize,
    pub queue_capacity: usize,
    pub keepalive_interval_secs: u64,
    pub backlog: u32,
    pub poll_interval_ms: u64,
    pub queue_pop_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_PROXY_HOST,
            proxy_port: 0,
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: 0,
            replay_log: PathBuf::from(DEFAULT_REPLAY_LOG),
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            keepalive_interval_secs: DEFAULT_KEEP_ALIVE_INTERVAL_SECS,
            backlog: DEFAULT_BACKLOG,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            queue_pop_timeout_ms: DEFAULT_QUEUE_POP_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Reads a TOML configuration file. The result is not validated yet.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Builds the final configuration: file (if any), then flag overrides,
    /// then validation.
    pub fn load(args: &ServeArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        args.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_port == 0 {
            return Err(ConfigError::MissingUpstreamPort);
        }
        if self.server_host.trim().is_empty() {
            return Err(ConfigError::BadAddress("empty upstream host".to_string()));
        }
        if self.buffer_size < 2 {
            return Err(ConfigError::NotInRange(format!(
                "buffer_size must be at least 2, got {}",
                self.buffer_size
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::NotInRange(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 || self.queue_pop_timeout_ms == 0 {
            return Err(ConfigError::NotInRange(
                "poll and queue timeouts must be greater than 0".to_string(),
            ));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(ConfigError::NotInRange(
                "keepalive_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` of the upstream server, as given (not resolved).
    pub fn upstream(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn queue_pop_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_pop_timeout_ms)
    }
}

/// Command-line flags of the `serve` command.
///
/// Each flag overrides the matching key of the configuration file and can
/// also be provided through its environment variable.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long, env = "REPLAY_PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind the proxy to
    #[arg(long, env = "REPLAY_PROXY_BIND_ADDRESS")]
    pub bind_address: Option<IpAddr>,

    /// Port the proxy listens on
    #[arg(long, env = "REPLAY_PROXY_PORT")]
    pub proxy_port: Option<u16>,

    /// Host name of the proxied server
    #[arg(long, env = "REPLAY_PROXY_SERVER_HOST")]
    pub server_host: Option<String>,

    /// Port of the proxied server
    #[arg(long, env = "REPLAY_PROXY_SERVER_PORT")]
    pub server_port: Option<u16>,

    /// File the replay log is written to
    #[arg(long, env = "REPLAY_PROXY_REPLAY_LOG")]
    pub replay_log: Option<PathBuf>,

    /// Size of a single RECV, in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Capacity of the capture queue
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// TCP keepalive interval applied to accepted connections, in seconds
    #[arg(long)]
    pub keepalive_interval_secs: Option<u64>,
}

impl ServeArgs {
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(addr) = self.bind_address {
            config.bind_address = addr;
        }
        if let Some(port) = self.proxy_port {
            config.proxy_port = port;
        }
        if let Some(ref host) = self.server_host {
            config.server_host = host.clone();
        }
        if let Some(port) = self.server_port {
            config.server_port = port;
        }
        if let Some(ref path) = self.replay_log {
            config.replay_log = path.clone();
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(secs) = self.keepalive_interval_secs {
            config.keepalive_interval_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serial_test::serial;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ServeArgs,
    }

    fn parse(argv: &[&str]) -> ServeArgs {
        TestCli::try_parse_from(argv)
            .unwrap_or_else(|e| panic!("{}", e))
            .args
    }

    #[test]
    fn from_file_fills_missing_keys_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proxy.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "server_host = \"127.0.0.1\"").unwrap();
        writeln!(f, "server_port = 5432").unwrap();
        writeln!(f, "queue_capacity = 16").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server_host, "127.0.0.1");
        assert_eq!(config.server_port, 5432);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
        assert_eq!(config.upstream(), "127.0.0.1:5432");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_file_rejects_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proxy.toml");
        std::fs::write(&path, "server_prot = 1\n").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TomlError(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::from_file(Path::new("/nonexistent/proxy.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    #[serial]
    fn flags_override_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proxy.toml");
        std::fs::write(&path, "server_port = 5432\nproxy_port = 6000\n").unwrap();
        let path_str = path.to_string_lossy().to_string();

        let args = parse(&[
            "test",
            "--config",
            &path_str,
            "--proxy-port",
            "7000",
            "--bind-address",
            "127.0.0.1",
            "--replay-log",
            "/tmp/out.bin",
        ]);
        let config = Config::load(&args).unwrap();

        assert_eq!(config.server_port, 5432);
        assert_eq!(config.proxy_port, 7000);
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.replay_log, PathBuf::from("/tmp/out.bin"));
    }

    #[test]
    #[serial]
    fn server_port_from_env() {
        std::env::set_var("REPLAY_PROXY_SERVER_PORT", "8081");
        let args = parse(&["test"]);
        std::env::remove_var("REPLAY_PROXY_SERVER_PORT");

        assert_eq!(args.server_port, Some(8081));
        let config = Config::load(&args).unwrap();
        assert_eq!(config.server_port, 8081);
        assert_eq!(config.server_host, DEFAULT_SERVER_HOST);
    }

    #[test]
    #[serial]
    fn load_without_upstream_port_fails() {
        let err = Config::load(&parse(&["test"])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingUpstreamPort));
    }

    #[test]
    fn validate_rejects_degenerate_sizes() {
        let config = Config {
            server_port: 1,
            buffer_size: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));

        let config = Config {
            server_port: 1,
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));
    }
}
