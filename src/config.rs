//! Configuration for the conveyor server.
//!
//! Three layers, merged in precedence order: command-line arguments,
//! `PROXYSERVER_*` environment variables (handled by clap), and an optional
//! TOML configuration file. The merged result is validated once at startup
//! and never mutated afterwards.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Command-line arguments for the dispatch server
#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(version = "0.1.0")]
#[command(about = "A multi-listener TCP dispatch server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of listener threads
    #[arg(short = 'l', long = "num-listeners", env = "PROXYSERVER_NUM_LISTENERS")]
    pub num_listeners: Option<usize>,

    /// Number of worker threads
    #[arg(short = 'w', long = "num-workers", env = "PROXYSERVER_NUM_WORKERS")]
    pub num_workers: Option<usize>,

    /// Port of the first listener; subsequent listeners take successive ports
    #[arg(
        short = 'p',
        long = "port-hint",
        env = "PROXYSERVER_PORT",
        conflicts_with = "port_list"
    )]
    pub port_hint: Option<u16>,

    /// Comma-separated list of ports, one per listener
    #[arg(short = 'P', long = "use-ports")]
    pub port_list: Option<String>,

    /// Size of the network read buffer in bytes
    #[arg(short = 's', long = "chunk-size", env = "PROXYSERVER_CHUNK_SIZE")]
    pub chunk_size: Option<usize>,

    /// Append an extra NUL byte to all network writes
    #[arg(
        short = 'a',
        long = "auto-append-null",
        env = "PROXYSERVER_AUTO_APPEND_NULL"
    )]
    pub auto_append: Option<bool>,

    /// Socket read timeout in milliseconds
    #[arg(short = 't', long = "timeout", env = "PROXYSERVER_TIMEOUT")]
    pub timeout_ms: Option<u64>,

    /// Path to log file (defaults to stdout)
    #[arg(short = 'f', long = "log-file")]
    pub log_file: Option<PathBuf>,

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
    pub framing: FramingSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Number of listener threads
    #[serde(default = "default_listeners")]
    pub listeners: usize,
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Port of the first listener
    #[serde(default = "default_port_hint")]
    pub port_hint: u16,
    /// Explicit comma-separated port list, one per listener
    pub port_list: Option<String>,
    /// Socket read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listeners: default_listeners(),
            workers: default_workers(),
            port_hint: default_port_hint(),
            port_list: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Framing-related configuration
#[derive(Debug, Deserialize)]
pub struct FramingSection {
    /// Size of the network read buffer in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Append an extra NUL byte to all network writes
    #[serde(default = "default_auto_append")]
    pub auto_append_null: bool,
}

impl Default for FramingSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            auto_append_null: default_auto_append(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listeners() -> usize {
    1
}

fn default_workers() -> usize {
    1
}

fn default_port_hint() -> u16 {
    8000
}

fn default_chunk_size() -> usize {
    0x400 // 1 KB
}

fn default_auto_append() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub num_listeners: usize,
    pub num_workers: usize,
    pub port_hint: u16,
    pub port_list: Option<String>,
    pub chunk_size: usize,
    pub auto_append: bool,
    pub timeout_ms: u64,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args (with env-var fallbacks) and an
    /// optional TOML file. CLI and environment take precedence over the
    /// file, which takes precedence over the built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            num_listeners: cli.num_listeners.unwrap_or(toml_config.server.listeners),
            num_workers: cli.num_workers.unwrap_or(toml_config.server.workers),
            port_hint: cli.port_hint.unwrap_or(toml_config.server.port_hint),
            port_list: cli.port_list.or(toml_config.server.port_list),
            chunk_size: cli.chunk_size.unwrap_or(toml_config.framing.chunk_size),
            auto_append: cli
                .auto_append
                .unwrap_or(toml_config.framing.auto_append_null),
            timeout_ms: cli.timeout_ms.unwrap_or(toml_config.server.timeout_ms),
            log_file: cli.log_file.or(toml_config.logging.file),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// The immutable settings handed to the server.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            num_listeners: self.num_listeners,
            num_workers: self.num_workers,
            port_hint: self.port_hint,
            port_list: self.port_list.clone(),
            chunk_size: self.chunk_size,
            auto_append: self.auto_append,
            timeout_ms: self.timeout_ms,
            log_file: self.log_file.clone(),
        }
    }
}

/// Immutable server settings, owned by the `Server` for its whole lifetime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_listeners: usize,
    pub num_workers: usize,
    pub port_hint: u16,
    pub port_list: Option<String>,
    pub chunk_size: usize,
    pub auto_append: bool,
    pub timeout_ms: u64,
    pub log_file: Option<PathBuf>,
}

/// Settings for a single listener: the port it binds.
#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    pub port: u16,
}

/// Per-worker settings, copied by value from the server configuration so
/// every worker owns an identical, independent copy.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub chunk_size: usize,
    pub timeout: Duration,
    pub auto_append: bool,
}

impl ServerConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            chunk_size: self.chunk_size,
            timeout: Duration::from_millis(self.timeout_ms),
            auto_append: self.auto_append,
        }
    }

    /// Compute the port each listener binds, in listener order.
    ///
    /// With an explicit port list the ports are taken positionally and the
    /// list length must match the listener count; otherwise ports are
    /// assigned sequentially starting at the hint.
    pub fn ports(&self) -> Result<Vec<u16>, ConfigError> {
        match &self.port_list {
            Some(list) => {
                let mut ports = Vec::new();
                for entry in list.split(',') {
                    let entry = entry.trim();
                    let port: u16 = entry
                        .parse()
                        .map_err(|_| ConfigError::InvalidPort(entry.to_string()))?;
                    ports.push(port);
                }

                if ports.len() != self.num_listeners {
                    return Err(ConfigError::PortCountMismatch {
                        listeners: self.num_listeners,
                        ports: ports.len(),
                    });
                }

                Ok(ports)
            }
            None => {
                let mut ports = Vec::with_capacity(self.num_listeners);
                for i in 0..self.num_listeners {
                    let port = u32::from(self.port_hint) + i as u32;
                    if port > u32::from(u16::MAX) {
                        return Err(ConfigError::InvalidPort(port.to_string()));
                    }
                    ports.push(port as u16);
                }
                Ok(ports)
            }
        }
    }

    /// Check every rule at once and report the full list of violations.
    ///
    /// Ports in the privileged range are flagged through the log but do not
    /// fail validation, in either the hint or the explicit-list path.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut violations = Vec::new();

        if self.num_listeners < 1 {
            violations.push(ConfigError::TooFewListeners);
        }

        if self.num_workers < 1 {
            violations.push(ConfigError::TooFewWorkers);
        }

        if self.chunk_size == 0 {
            violations.push(ConfigError::ZeroChunkSize);
        }

        if self.timeout_ms == 0 {
            violations.push(ConfigError::ZeroTimeout);
        }

        match self.ports() {
            Ok(ports) => {
                for port in ports {
                    if port < 1024 {
                        warn!(port, "port is in the privileged range; binding may need elevated permissions");
                    }
                }
            }
            Err(e) => violations.push(e),
        }

        if let Some(path) = &self.log_file {
            if path.is_dir() {
                violations.push(ConfigError::LogPathIsDirectory(path.clone()));
            } else if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.is_dir() {
                    violations.push(ConfigError::LogDirMissing(path.clone()));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Configuration loading and validation errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    TooFewListeners,
    TooFewWorkers,
    ZeroChunkSize,
    ZeroTimeout,
    InvalidPort(String),
    PortCountMismatch { listeners: usize, ports: usize },
    LogPathIsDirectory(PathBuf),
    LogDirMissing(PathBuf),
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
            ConfigError::TooFewListeners => write!(f, "Cannot have fewer than 1 listener"),
            ConfigError::TooFewWorkers => write!(f, "Cannot have fewer than 1 worker"),
            ConfigError::ZeroChunkSize => write!(f, "Chunk size must be positive"),
            ConfigError::ZeroTimeout => write!(f, "Timeout must be positive"),
            ConfigError::InvalidPort(port) => write!(f, "{port} is not a valid port number"),
            ConfigError::PortCountMismatch { listeners, ports } => {
                let kind = if ports > listeners { "Too many" } else { "Too few" };
                write!(
                    f,
                    "{kind} ports specified. There are {listeners} listeners, but {ports} ports were given"
                )
            }
            ConfigError::LogPathIsDirectory(path) => {
                write!(f, "{} already exists and is a directory", path.display())
            }
            ConfigError::LogDirMissing(path) => {
                write!(f, "{} is not a valid log file path", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            num_listeners: 1,
            num_workers: 1,
            port_hint: 8000,
            port_list: None,
            chunk_size: 1024,
            auto_append: true,
            timeout_ms: 1000,
            log_file: None,
        }
    }

    #[test]
    fn test_default_toml_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listeners, 1);
        assert_eq!(config.server.workers, 1);
        assert_eq!(config.server.port_hint, 8000);
        assert_eq!(config.framing.chunk_size, 1024);
        assert!(config.framing.auto_append_null);
        assert_eq!(config.server.timeout_ms, 1000);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listeners = 3
            workers = 8
            port_hint = 9000
            timeout_ms = 250

            [framing]
            chunk_size = 4096
            auto_append_null = false

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listeners, 3);
        assert_eq!(config.server.workers, 8);
        assert_eq!(config.server.port_hint, 9000);
        assert_eq!(config.server.timeout_ms, 250);
        assert_eq!(config.framing.chunk_size, 4096);
        assert!(!config.framing.auto_append_null);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_sequential_ports_from_hint() {
        let config = ServerConfig {
            num_listeners: 3,
            port_hint: 9000,
            ..base_config()
        };
        assert_eq!(config.ports().unwrap(), vec![9000, 9001, 9002]);
    }

    #[test]
    fn test_explicit_port_list_is_positional() {
        let config = ServerConfig {
            num_listeners: 3,
            port_list: Some("9002, 9000,9001".to_string()),
            ..base_config()
        };
        assert_eq!(config.ports().unwrap(), vec![9002, 9000, 9001]);
    }

    #[test]
    fn test_too_few_ports_in_list() {
        let config = ServerConfig {
            num_listeners: 3,
            port_list: Some("9000,9001".to_string()),
            ..base_config()
        };
        let err = config.ports().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::PortCountMismatch {
                listeners: 3,
                ports: 2
            }
        ));
        assert!(err.to_string().starts_with("Too few"));
    }

    #[test]
    fn test_too_many_ports_in_list() {
        let config = ServerConfig {
            num_listeners: 3,
            port_list: Some("9000,9001,9002,9003".to_string()),
            ..base_config()
        };
        let err = config.ports().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::PortCountMismatch {
                listeners: 3,
                ports: 4
            }
        ));
        assert!(err.to_string().starts_with("Too many"));
    }

    #[test]
    fn test_unparsable_port_entry() {
        let config = ServerConfig {
            num_listeners: 2,
            port_list: Some("9000,abc".to_string()),
            ..base_config()
        };
        assert!(matches!(
            config.ports().unwrap_err(),
            ConfigError::InvalidPort(entry) if entry == "abc"
        ));
    }

    #[test]
    fn test_out_of_range_port_entry() {
        let config = ServerConfig {
            num_listeners: 1,
            port_list: Some("70000".to_string()),
            ..base_config()
        };
        assert!(matches!(
            config.ports().unwrap_err(),
            ConfigError::InvalidPort(_)
        ));
    }

    #[test]
    fn test_hint_sequence_cannot_pass_port_range() {
        let config = ServerConfig {
            num_listeners: 2,
            port_hint: 65535,
            ..base_config()
        };
        assert!(matches!(
            config.ports().unwrap_err(),
            ConfigError::InvalidPort(_)
        ));
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let config = ServerConfig {
            num_listeners: 0,
            num_workers: 0,
            chunk_size: 0,
            timeout_ms: 0,
            port_list: Some("9000".to_string()),
            ..base_config()
        };
        let violations = config.validate().unwrap_err();
        // counts, chunk size, timeout, and the port list/listener mismatch
        assert_eq!(violations.len(), 5);
    }

    #[test]
    fn test_privileged_ports_warn_but_validate() {
        let config = ServerConfig {
            num_listeners: 2,
            port_list: Some("80,443".to_string()),
            ..base_config()
        };
        assert!(config.validate().is_ok());

        let config = ServerConfig {
            port_hint: 443,
            ..base_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_worker_config_copies_server_settings() {
        let config = ServerConfig {
            chunk_size: 2048,
            auto_append: false,
            timeout_ms: 750,
            ..base_config()
        };
        let worker = config.worker_config();
        assert_eq!(worker.chunk_size, 2048);
        assert!(!worker.auto_append);
        assert_eq!(worker.timeout, Duration::from_millis(750));
    }
}
