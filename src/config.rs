//! Configuration for the echo server binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use completion_server::{
    ServerOptions, DEFAULT_BACKLOG, DEFAULT_RECV_BUFFER_SIZE, DEFAULT_WORKERS, MAX_POST_ACCEPT,
};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "echo-server")]
#[command(version)]
#[command(about = "Echo server on a completion-queue TCP engine", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IP address to bind to
    #[arg(short, long)]
    pub address: Option<String>,

    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Accept operations kept outstanding on the listener
    #[arg(long)]
    pub accept_pool: Option<usize>,

    /// Size of each receive in bytes
    #[arg(long)]
    pub recv_buffer_size: Option<usize>,

    /// SO_SNDBUF for accepted connections in bytes (OS default if unset)
    #[arg(long)]
    pub send_buffer_size: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub workers: usize,
    pub accept_pool: usize,
    pub recv_buffer_size: usize,
    pub send_buffer_size: Option<usize>,
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8888,
            workers: DEFAULT_WORKERS,
            accept_pool: MAX_POST_ACCEPT,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            send_buffer_size: None,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub options: ServerOptions,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        Config {
            address: cli.address.unwrap_or(server.address),
            port: cli.port.unwrap_or(server.port),
            options: ServerOptions {
                workers: cli.workers.unwrap_or(server.workers),
                accept_pool_size: cli.accept_pool.unwrap_or(server.accept_pool),
                recv_buffer_size: cli.recv_buffer_size.unwrap_or(server.recv_buffer_size),
                send_buffer_size: cli.send_buffer_size.or(server.send_buffer_size),
                backlog: cli.backlog.unwrap_or(server.backlog),
            },
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
