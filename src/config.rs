//! Configuration module for the memcached interceptor
//!
//! This module handles CLI argument parsing with environment variable support.
//! Hook selection lives in an optional TOML hook file, see `business::loader`.

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::hooks::DefaultAction;
use crate::core::protocol::DEFAULT_MAX_BODY_LEN;
use crate::logger::log;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Default memcached binary protocol port
pub const DEFAULT_PORT: u16 = 11210;

/// CLI arguments for the interceptor
///
/// Supports environment variables with MEMD_PROXY_ prefix
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Intercepting proxy for the memcached binary protocol"
)]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Address to listen on
    #[arg(long, env = "MEMD_PROXY_LISTEN", default_value = "0.0.0.0")]
    pub listen: String,

    /// Port to listen on
    #[arg(long = "listen_port", env = "MEMD_PROXY_LISTEN_PORT", default_value_t = DEFAULT_PORT)]
    pub listen_port: u16,

    /// Backend memcached host
    #[arg(
        long = "backend_host",
        env = "MEMD_PROXY_BACKEND_HOST",
        default_value = "127.0.0.1"
    )]
    pub backend_host: String,

    /// Backend memcached port
    #[arg(long = "backend_port", env = "MEMD_PROXY_BACKEND_PORT", default_value_t = DEFAULT_PORT)]
    pub backend_port: u16,

    /// Hook file (.toml) selecting the hooks to register
    #[arg(long = "hooks_file", env = "MEMD_PROXY_HOOKS_FILE")]
    pub hooks_file: Option<PathBuf>,

    /// What to do with packets no hook decided on: forward or drop (overrides the hook file)
    #[arg(long = "default_action", env = "MEMD_PROXY_DEFAULT_ACTION")]
    pub default_action: Option<DefaultAction>,

    /// Packet logging verbosity, repeat up to three times
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "MEMD_PROXY_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    // ==================== Performance Tuning ====================
    /// Connection idle timeout - disconnect if no data transferred (default: 5m)
    #[arg(long, env = "MEMD_PROXY_CONN_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub conn_idle_timeout: Duration,

    /// TCP connect timeout to the backend (default: 5s)
    #[arg(long, env = "MEMD_PROXY_BACKEND_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub backend_connect_timeout: Duration,

    /// Upper bound on a single hook invocation (default: none)
    #[arg(long, env = "MEMD_PROXY_HOOK_TIMEOUT", value_parser = parse_duration, help_heading = "Performance")]
    pub hook_timeout: Option<Duration>,

    /// Read buffer size in bytes (default: 32KB)
    #[arg(long, env = "MEMD_PROXY_BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// Largest accepted packet body in bytes (default: 20MB)
    #[arg(long, env = "MEMD_PROXY_MAX_BODY_SIZE", default_value_t = DEFAULT_MAX_BODY_LEN, help_heading = "Performance")]
    pub max_body_size: usize,

    /// Maximum concurrent client connections, 0 for unlimited
    #[arg(
        long,
        env = "MEMD_PROXY_MAX_CONNECTIONS",
        default_value_t = 0,
        help_heading = "Performance"
    )]
    pub max_connections: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "MEMD_PROXY_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "MEMD_PROXY_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// Interval for logging packet statistics, 0 disables (default: 60s)
    #[arg(long, env = "MEMD_PROXY_STATS_INTERVAL", default_value = "60s", value_parser = parse_duration, help_heading = "Performance")]
    pub stats_interval: Duration,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(anyhow!("listen address is required"));
        }
        if self.backend_host.is_empty() {
            return Err(anyhow!("backend host is required (--backend_host)"));
        }
        if self.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }
        if self.max_body_size == 0 {
            return Err(anyhow!("max_body_size must be greater than 0"));
        }
        if self.max_body_size > u32::MAX as usize {
            return Err(anyhow!(
                "max_body_size cannot exceed the protocol limit of {} bytes",
                u32::MAX
            ));
        }
        if self.verbose > 3 {
            return Err(anyhow!("verbosity above -vvv is not supported"));
        }
        if self.hook_timeout.is_some_and(|t| t.is_zero()) {
            return Err(anyhow!("hook_timeout must be greater than 0"));
        }

        if let Some(ref path) = self.hooks_file {
            if !path.exists() {
                return Err(anyhow!("Hook file not found: {}", path.display()));
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !ext.eq_ignore_ascii_case("toml") {
                return Err(anyhow!(
                    "Invalid hook file format: expected .toml extension"
                ));
            }
        }

        if self.backend_loops_back() {
            log::warn!(
                backend = %self.backend_addr(),
                "Backend is a loopback address on the listen port, the proxy may connect to itself"
            );
        }

        Ok(())
    }

    /// Whether the backend points back at this listener
    pub fn backend_loops_back(&self) -> bool {
        if self.backend_port != self.listen_port {
            return false;
        }
        if self.backend_host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        self.backend_host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback() || ip.is_unspecified())
            .unwrap_or(false)
    }

    pub fn listen_addr(&self) -> String {
        join_host_port(&self.listen, self.listen_port)
    }

    pub fn backend_addr(&self) -> String {
        join_host_port(&self.backend_host, self.backend_port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// Backend connect timeout
    pub connect_timeout: Duration,
    /// Per-hook invocation timeout
    pub hook_timeout: Option<Duration>,
    /// Read buffer size
    pub buffer_size: usize,
    /// Largest accepted packet body
    pub max_body_size: usize,
    /// Concurrent connection limit, 0 for unlimited
    pub max_connections: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            hook_timeout: None,
            buffer_size: 32 * 1024,
            max_body_size: DEFAULT_MAX_BODY_LEN,
            max_connections: 0,
            tcp_backlog: 1024,
            tcp_nodelay: true,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.conn_idle_timeout,
            connect_timeout: cli.backend_connect_timeout,
            hook_timeout: cli.hook_timeout,
            buffer_size: cli.buffer_size,
            max_body_size: cli.max_body_size,
            max_connections: cli.max_connections,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
        }
    }

    /// Capacity of a connection's outbound channel, in packets
    pub fn outbound_capacity(&self) -> usize {
        (self.buffer_size / 256).clamp(16, 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_cli_args() -> CliArgs {
        CliArgs {
            listen: "0.0.0.0".to_string(),
            listen_port: 11211,
            backend_host: "127.0.0.1".to_string(),
            backend_port: DEFAULT_PORT,
            hooks_file: None,
            default_action: None,
            verbose: 0,
            log_mode: "info".to_string(),
            conn_idle_timeout: Duration::from_secs(300),
            backend_connect_timeout: Duration::from_secs(5),
            hook_timeout: None,
            buffer_size: 32 * 1024,
            max_body_size: DEFAULT_MAX_BODY_LEN,
            max_connections: 0,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            stats_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_cli_args_parse_defaults() {
        let cli = CliArgs::try_parse_from(["memd-interceptor"]).unwrap();
        assert_eq!(cli.listen_port, DEFAULT_PORT);
        assert_eq!(cli.backend_host, "127.0.0.1");
        assert_eq!(cli.backend_port, DEFAULT_PORT);
        assert_eq!(cli.conn_idle_timeout, Duration::from_secs(300));
        assert_eq!(cli.stats_interval, Duration::from_secs(60));
        assert_eq!(cli.max_body_size, DEFAULT_MAX_BODY_LEN);
        assert_eq!(cli.default_action, None);
        assert_eq!(cli.verbose, 0);
        assert!(cli.hook_timeout.is_none());
    }

    #[test]
    fn test_cli_args_parse_flags() {
        let cli = CliArgs::try_parse_from([
            "memd-interceptor",
            "-vv",
            "--backend_port",
            "11211",
            "--default_action",
            "drop",
            "--hook_timeout",
            "250ms",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.backend_port, 11211);
        assert_eq!(cli.default_action, Some(DefaultAction::Drop));
        assert_eq!(cli.hook_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_cli_args_validate_success() {
        assert!(create_test_cli_args().validate().is_ok());
    }

    #[test]
    fn test_cli_args_validate_zero_sizes() {
        let mut cli = create_test_cli_args();
        cli.buffer_size = 0;
        assert!(cli.validate().is_err());

        let mut cli = create_test_cli_args();
        cli.max_body_size = 0;
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_args_validate_empty_backend() {
        let mut cli = create_test_cli_args();
        cli.backend_host = "".to_string();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_args_validate_hooks_file() {
        let mut cli = create_test_cli_args();
        cli.hooks_file = Some(PathBuf::from("/nonexistent/hooks.toml"));
        assert!(cli.validate().is_err());

        let temp_dir = tempfile::tempdir().unwrap();
        let yaml = temp_dir.path().join("hooks.yaml");
        std::fs::write(&yaml, "hooks: []").unwrap();
        cli.hooks_file = Some(yaml);
        assert!(cli.validate().is_err());

        let toml = temp_dir.path().join("hooks.toml");
        std::fs::write(&toml, "").unwrap();
        cli.hooks_file = Some(toml);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_backend_loops_back() {
        let mut cli = create_test_cli_args();
        assert!(!cli.backend_loops_back());

        cli.backend_port = cli.listen_port;
        assert!(cli.backend_loops_back());

        cli.backend_host = "localhost".to_string();
        assert!(cli.backend_loops_back());

        cli.backend_host = "10.0.0.7".to_string();
        assert!(!cli.backend_loops_back());

        // Still valid, only warned about
        cli.backend_host = "127.0.0.1".to_string();
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_addr_formatting() {
        let mut cli = create_test_cli_args();
        assert_eq!(cli.listen_addr(), "0.0.0.0:11211");
        assert_eq!(cli.backend_addr(), "127.0.0.1:11210");

        cli.backend_host = "::1".to_string();
        assert_eq!(cli.backend_addr(), "[::1]:11210");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_conn_config_from_cli() {
        let mut cli = create_test_cli_args();
        cli.hook_timeout = Some(Duration::from_secs(1));
        cli.max_connections = 64;
        let config = ConnConfig::from_cli(&cli);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.hook_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.outbound_capacity(), 128);
    }
}
