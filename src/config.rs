//! Configuration for the portside server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionConfig;

/// Listener and admission settings handed to `Server::new`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Listen backlog passed to the OS.
    pub backlog: u32,
    /// Admission cap on concurrent connections.
    pub max_connections: usize,
    /// Per-session settings copied into each accepted session.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            backlog: 128,
            max_connections: 10_000,
            session: SessionConfig::default(),
        }
    }
}

/// Command-line arguments for the server binary
#[derive(Parser, Debug)]
#[command(name = "portside")]
#[command(version = "0.1.0")]
#[command(about = "An embeddable HTTP/WebSocket server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Keep-alive continuations granted per session
    #[arg(short = 'k', long)]
    pub max_keep_alives: Option<u32>,

    /// Maximum concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Session read timeout in milliseconds
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Session write timeout in milliseconds
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
        }
    }
}

/// Session-related configuration
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    /// Keep-alive continuations granted per session
    #[serde(default = "default_max_keep_alives")]
    pub max_keep_alives: u32,
    /// Read buffer size in bytes
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Write timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_keep_alives: default_max_keep_alives(),
            read_buffer_size: default_read_buffer_size(),
            read_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_backlog() -> u32 {
    128
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_keep_alives() -> u32 {
    100
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: u32,
    pub max_connections: usize,
    pub max_keep_alives: u32,
    pub read_buffer_size: usize,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_keep_alives: cli
                .max_keep_alives
                .unwrap_or(toml_config.session.max_keep_alives),
            read_buffer_size: toml_config.session.read_buffer_size,
            read_timeout_ms: cli
                .read_timeout_ms
                .unwrap_or(toml_config.session.read_timeout_ms),
            write_timeout_ms: cli
                .write_timeout_ms
                .unwrap_or(toml_config.session.write_timeout_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Typed server configuration, with the listen address parsed.
    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let listen = self
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.listen.clone()))?;

        Ok(ServerConfig {
            listen,
            backlog: self.backlog,
            max_connections: self.max_connections,
            session: SessionConfig {
                max_keep_alives: self.max_keep_alives,
                read_buffer_size: self.read_buffer_size,
                read_timeout: Duration::from_millis(self.read_timeout_ms),
                write_timeout: Duration::from_millis(self.write_timeout_ms),
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{addr}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
