//! portmux configuration.
//!
//! Flags can also be supplied through environment variables. The environment
//! name selects the directory holding the certificate bundle and backend log.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Result};
use clap::{Parser, ValueEnum};

use crate::mux::ListenerConfig;
use crate::supervisor::BackendCommand;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Command line interface.
#[derive(Debug, Clone, Parser)]
#[command(name = "portmux")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to bind the public port on.
    #[arg(long, env = "PORTMUX_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Public port serving both TLS and plaintext HTTP.
    #[arg(long, env = "PORTMUX_PORT", default_value_t = 8085)]
    pub port: u16,

    /// Loopback port the TLS backend listens on.
    #[arg(long, env = "PORTMUX_BACKEND_PORT", default_value_t = 8086)]
    pub flask_port: u16,

    /// Root directory for per-environment state.
    #[arg(long, env = "PORTMUX_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Environment name (subdirectory of the data directory).
    #[arg(long, env = "APP_ENV", default_value = "prod")]
    pub environment: String,

    /// Host used in redirects when the request has no usable Host header.
    #[arg(long, env = "PORTMUX_REDIRECT_HOST", default_value = "localhost")]
    pub redirect_host: String,

    /// Maximum concurrent connections on the public port.
    #[arg(long, env = "PORTMUX_MAX_CONNECTIONS", default_value_t = 10000)]
    pub max_connections: usize,

    /// Backend program.
    #[arg(long, env = "PORTMUX_BACKEND_PROGRAM", default_value = "python3")]
    pub backend_program: String,

    /// Backend argument, repeatable. `--ssl --port <flask-port>` is appended.
    #[arg(
        long = "backend-arg",
        default_value = "app.py",
        allow_hyphen_values = true
    )]
    pub backend_args: Vec<String>,

    /// Do not start the backend; only wait for it to be reachable.
    #[arg(long)]
    pub no_backend: bool,

    /// Backend stdout/stderr log file. Defaults to `<data-dir>/<env>/backend.log`.
    #[arg(long, env = "PORTMUX_BACKEND_LOG")]
    pub backend_log: Option<PathBuf>,

    /// Seconds to wait for the backend to become reachable.
    #[arg(long, default_value_t = 30)]
    pub backend_ready_timeout_secs: u64,

    /// Seconds to wait for open connections on shutdown.
    #[arg(long, default_value_t = 10)]
    pub drain_timeout_secs: u64,

    /// Certificate generation tool.
    #[arg(long, env = "PORTMUX_OPENSSL", default_value = "openssl")]
    pub openssl: String,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, env = "PORTMUX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "PORTMUX_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Public listening address.
    pub bind_addr: SocketAddr,

    /// Loopback backend address.
    pub backend_addr: SocketAddr,

    /// Directory holding the certificate bundle.
    pub env_dir: PathBuf,

    /// Environment name.
    pub environment: String,

    /// Fallback redirect host.
    pub redirect_host: String,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Backend to spawn; `None` when it is managed externally.
    pub backend: Option<BackendCommand>,

    /// Backend readiness timeout.
    pub backend_ready_timeout: Duration,

    /// Graceful drain timeout.
    pub drain_timeout: Duration,

    /// Certificate generation tool.
    pub openssl: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Config {
    /// Parse and validate the process arguments.
    pub fn load() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    /// Validate parsed arguments and derive paths.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        ensure!(cli.port != 0, "--port must be non-zero");
        ensure!(cli.flask_port != 0, "--flask-port must be non-zero");
        ensure!(
            cli.port != cli.flask_port,
            "--port and --flask-port must differ (both {})",
            cli.port
        );
        ensure!(cli.max_connections > 0, "--max-connections must be positive");
        ensure!(!cli.environment.is_empty(), "environment name must not be empty");
        ensure!(
            !cli.environment.contains(['/', '\\']) && cli.environment != "..",
            "environment name must be a single path component: {}",
            cli.environment
        );

        let env_dir = cli.data_dir.join(&cli.environment);
        let backend_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, cli.flask_port));

        let backend = (!cli.no_backend).then(|| BackendCommand {
            program: cli.backend_program,
            args: cli.backend_args,
            port: cli.flask_port,
            log_path: cli
                .backend_log
                .unwrap_or_else(|| env_dir.join("backend.log")),
        });

        Ok(Self {
            bind_addr: SocketAddr::new(cli.host, cli.port),
            backend_addr,
            env_dir,
            environment: cli.environment,
            redirect_host: cli.redirect_host,
            max_connections: cli.max_connections,
            backend,
            backend_ready_timeout: Duration::from_secs(cli.backend_ready_timeout_secs),
            drain_timeout: Duration::from_secs(cli.drain_timeout_secs),
            openssl: cli.openssl,
            log_level: cli.log_level,
            log_format: cli.log_format,
        })
    }

    /// Listener settings for the public port.
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            public_port: Some(self.bind_addr.port()),
            max_connections: self.max_connections,
            redirect_host: self.redirect_host.clone(),
            ..ListenerConfig::new(self.bind_addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Result<Config> {
        let argv = std::iter::once("portmux").chain(args.iter().copied());
        Config::from_cli(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn defaults() {
        let config = parse(&["--environment", "prod", "--data-dir", "data"]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8085".parse().unwrap());
        assert_eq!(config.backend_addr, "127.0.0.1:8086".parse().unwrap());
        assert_eq!(config.env_dir, PathBuf::from("data/prod"));
        assert_eq!(config.drain_timeout, Duration::from_secs(10));

        let backend = config.backend.unwrap();
        assert_eq!(backend.log_path, PathBuf::from("data/prod/backend.log"));
        assert_eq!(backend.command_args(), ["app.py", "--ssl", "--port", "8086"]);
    }

    #[test]
    fn backend_arguments_and_ports() {
        let config = parse(&[
            "--port",
            "9443",
            "--flask-port",
            "9444",
            "--backend-program",
            "gunicorn",
            "--backend-arg",
            "-w",
            "--backend-arg",
            "2",
            "--backend-log",
            "/tmp/backend.log",
        ])
        .unwrap();

        let backend = config.backend.unwrap();
        assert_eq!(backend.program, "gunicorn");
        assert_eq!(backend.command_args(), ["-w", "2", "--ssl", "--port", "9444"]);
        assert_eq!(backend.log_path, PathBuf::from("/tmp/backend.log"));
    }

    #[test]
    fn external_backend() {
        let config = parse(&["--no-backend"]).unwrap();
        assert!(config.backend.is_none());
    }

    #[test]
    fn listener_config_advertises_public_port() {
        let config = parse(&["--host", "127.0.0.1", "--port", "9000", "--redirect-host", "example.com"])
            .unwrap();
        let listener = config.listener_config();
        assert_eq!(listener.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(listener.public_port, Some(9000));
        assert_eq!(listener.redirect_host, "example.com");
        assert_eq!(listener.io_timeout, Duration::from_secs(30));
    }

    #[rstest]
    #[case::same_ports(&["--port", "8086"])]
    #[case::zero_port(&["--port", "0"])]
    #[case::zero_backend_port(&["--flask-port", "0"])]
    #[case::zero_connections(&["--max-connections", "0"])]
    #[case::nested_environment(&["--environment", "../etc"])]
    #[case::bad_host(&["--host", "not-an-ip"])]
    fn rejects_invalid(#[case] args: &[&str]) {
        assert!(parse(args).is_err());
    }
}
