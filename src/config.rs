//! Configuration for the connector.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, matching the
//! convention used elsewhere in this codebase.

use crate::error::{ConnectorError, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the connector.
#[derive(Parser, Debug)]
#[command(name = "connector")]
#[command(about = "Connection front-end for a mining-pool server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to; may be repeated for multiple listeners
    #[arg(short = 'l', long = "listen")]
    pub listen: Vec<String>,

    /// Run in passthrough (proxy) mode: default port becomes 3334 and parsed
    /// client messages are routed to the generator peer instead of the stratifier
    #[arg(short = 'p', long)]
    pub proxy: bool,

    /// Maximum number of concurrently connected clients
    #[arg(short = 'm', long)]
    pub max_clients: Option<usize>,

    /// Path to the control socket (AF_UNIX, SOCK_DGRAM)
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Path of a running connector's control socket to request inherited
    /// listener fds from across a hot restart
    #[arg(long)]
    pub getfd_socket: Option<PathBuf>,

    /// Datagram socket path of the stratifier peer process
    #[arg(long)]
    pub stratifier_socket: Option<PathBuf>,

    /// Datagram socket path of the generator peer process
    #[arg(long)]
    pub generator_socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: Vec<String>,
    #[serde(default)]
    pub proxy: bool,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    pub control_socket: Option<PathBuf>,
    pub getfd_socket: Option<PathBuf>,
    pub stratifier_socket: Option<PathBuf>,
    pub generator_socket: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            proxy: false,
            max_clients: default_max_clients(),
            control_socket: None,
            getfd_socket: None,
            stratifier_socket: None,
            generator_socket: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_max_clients() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Default bind port when the process is not in passthrough mode.
pub const DEFAULT_PORT: u16 = 3333;
/// Default bind port when the process is in passthrough mode.
pub const DEFAULT_PROXY_PORT: u16 = 3334;

/// Final, resolved configuration used by every entry point.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Vec<String>,
    pub proxy: bool,
    pub max_clients: usize,
    pub control_socket: PathBuf,
    pub getfd_socket: Option<PathBuf>,
    pub stratifier_socket: PathBuf,
    pub generator_socket: PathBuf,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and an optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self> {
        let cli = CliArgs::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Self> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConnectorError::ConfigRead(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConnectorError::ConfigParse(path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let proxy = cli.proxy || toml_config.server.proxy;

        let mut listen = if !cli.listen.is_empty() {
            cli.listen
        } else {
            toml_config.server.listen
        };
        if listen.is_empty() {
            let port = if proxy { DEFAULT_PROXY_PORT } else { DEFAULT_PORT };
            listen.push(format!("0.0.0.0:{port}"));
        }

        let control_socket = cli
            .control_socket
            .or(toml_config.server.control_socket)
            .unwrap_or_else(|| PathBuf::from("/tmp/connector.sock"));

        Ok(Config {
            listen,
            proxy,
            max_clients: cli.max_clients.unwrap_or(toml_config.server.max_clients),
            control_socket,
            getfd_socket: cli.getfd_socket.or(toml_config.server.getfd_socket),
            stratifier_socket: cli
                .stratifier_socket
                .or(toml_config.server.stratifier_socket)
                .unwrap_or_else(|| PathBuf::from("/tmp/stratifier.sock")),
            generator_socket: cli
                .generator_socket
                .or(toml_config.server.generator_socket)
                .unwrap_or_else(|| PathBuf::from("/tmp/generator.sock")),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> CliArgs {
        CliArgs {
            config: None,
            listen: vec![],
            proxy: false,
            max_clients: None,
            control_socket: None,
            getfd_socket: None,
            stratifier_socket: None,
            generator_socket: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_default_listen_port_normal_mode() {
        let config = Config::from_cli(base_cli()).unwrap();
        assert_eq!(config.listen, vec!["0.0.0.0:3333".to_string()]);
    }

    #[test]
    fn test_default_listen_port_proxy_mode() {
        let mut cli = base_cli();
        cli.proxy = true;
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.listen, vec!["0.0.0.0:3334".to_string()]);
    }

    #[test]
    fn test_explicit_listen_overrides_default() {
        let mut cli = base_cli();
        cli.listen = vec!["127.0.0.1:5000".to_string()];
        cli.max_clients = Some(42);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.listen, vec!["127.0.0.1:5000".to_string()]);
        assert_eq!(config.max_clients, 42);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = ["0.0.0.0:3333", "[::]:3333"]
            max_clients = 5000

            [logging]
            level = "debug"
        "#;
        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen.len(), 2);
        assert_eq!(config.server.max_clients, 5000);
        assert_eq!(config.logging.level, "debug");
    }
}
