//! # Configuration Management
//!
//! Centralized configuration for relay network clients and the relay hub.
//!
//! ## Configuration Sources
//! - TOML files via [`Config::from_file`]
//! - Direct instantiation with defaults
//! - Environment overrides (`RELAYNET_BACKEND`, `RELAYNET_HOSTNAME`,
//!   `RELAYNET_TCP_ADDRESS`)
//!
//! ## Layout
//! ```toml
//! [app]
//! backend = "tcp"
//! source = ["./services"]
//!
//! [discovery]
//! alive_ttl = 60
//!
//! [config]            # settings shared by every backend
//! [config.tcp]        # settings for the tcp backend only
//! address = "127.0.0.1:7070"
//! ```
//! Backend settings are looked up with [`Config::search`], which prefers the
//! active backend's table over the shared one.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Max allowed packet body size (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Smallest JSON body that can hold a packet
pub const MIN_PAYLOAD_LEN: usize = 13;

/// Where the relay hub listens when nothing is configured
pub const DEFAULT_RELAY_ADDRESS: &str = "127.0.0.1:7070";

/// Backends [`crate::transport::backend::open`] knows how to build
pub const SUPPORTED_BACKENDS: [&str; 2] = ["memory", "tcp"];

/// Name of the config file looked for in source directories
pub const CONFIG_FILE_NAME: &str = "relaynet.toml";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    pub app: AppConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Shared backend settings, with one sub-table per backend
    #[serde(default)]
    pub config: toml::Table,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProtocolError::ConfigError(format!(
                "Failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Override settings from environment variables
    pub fn apply_env(&mut self) {
        if let Ok(backend) = std::env::var("RELAYNET_BACKEND") {
            self.app.backend = backend;
        }

        if let Ok(hostname) = std::env::var("RELAYNET_HOSTNAME") {
            self.app.hostname = Some(hostname);
        }

        if let Ok(address) = std::env::var("RELAYNET_TCP_ADDRESS") {
            self.set_backend_value("tcp", "address", toml::Value::String(address));
        }
    }

    /// Set a key in a backend's own table, creating the table if needed.
    pub fn set_backend_value(&mut self, backend: &str, key: &str, value: toml::Value) {
        let table = self
            .config
            .entry(backend.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if !table.is_table() {
            *table = toml::Value::Table(toml::Table::new());
        }
        if let toml::Value::Table(table) = table {
            table.insert(key.to_string(), value);
        }
    }

    /// Look a setting up in the active backend's table, then the shared one.
    pub fn search(&self, key: &str) -> Option<&toml::Value> {
        self.config
            .get(&self.app.backend)
            .and_then(toml::Value::as_table)
            .and_then(|table| table.get(key))
            .or_else(|| self.config.get(key))
    }

    pub fn search_str(&self, key: &str) -> Option<&str> {
        self.search(key).and_then(toml::Value::as_str)
    }

    /// Like [`search_str`](Self::search_str) but missing is a config error.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.search_str(key).ok_or_else(|| {
            ProtocolError::ConfigError(format!(
                "backend.{}: no `{key}` found in configuration",
                self.app.backend
            ))
        })
    }

    /// Hostname this process joins the network as
    pub fn hostname(&self) -> String {
        self.app
            .hostname
            .clone()
            .unwrap_or_else(|| crate::utils::host::local_hostname().to_string())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.app.validate());
        errors.extend(self.discovery.validate());
        errors.extend(self.logging.validate());
        errors.extend(self.validate_backend());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    fn validate_backend(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let backend = self.app.backend.as_str();

        if backend.is_empty() {
            return errors;
        }
        if !SUPPORTED_BACKENDS.contains(&backend) {
            errors.push(format!(
                "Unsupported backend: '{backend}' (expected one of: {})",
                SUPPORTED_BACKENDS.join(", ")
            ));
            return errors;
        }

        if backend == "tcp" {
            match self.search_str("address") {
                None => errors.push("backend.tcp: `address` must be set".to_string()),
                Some(address) if !is_host_port(address) => errors.push(format!(
                    "Invalid tcp relay address format: '{address}' (expected format: 'host:port')"
                )),
                Some(_) => {}
            }
        }

        errors
    }
}

fn is_host_port(address: &str) -> bool {
    address
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}

/// The `[app]` section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Name of the relay backend to use
    pub backend: String,

    /// Service source locations; a single string is accepted too
    #[serde(default, deserialize_with = "one_or_many")]
    pub source: Vec<PathBuf>,

    /// Overrides the system hostname
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: String::from("memory"),
            source: Vec::new(),
            hostname: None,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.backend.trim().is_empty() {
            errors.push("`backend` not specified in app config".to_string());
        }

        if let Some(ref hostname) = self.hostname {
            if hostname.trim().is_empty() {
                errors.push("Hostname cannot be empty when set".to_string());
            }
        }

        errors
    }
}

/// Timings of the discovery protocol, all in seconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// ttl of the Alive packet announcing a joining host
    pub alive_ttl: u64,
    /// ttl of the Sync packet sent after a timed out discovery
    pub sync_ttl: u64,
    /// ttl of the Hello the head answers with
    pub hello_ttl: u64,
    /// ttl of the Dead packet sent on shutdown
    pub dead_ttl: u64,
    /// Number of waiting steps; step k waits k seconds
    pub max_steps: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            alive_ttl: 60,
            sync_ttl: 30,
            hello_ttl: 15,
            dead_ttl: 15,
            max_steps: 15,
        }
    }
}

impl DiscoveryConfig {
    /// Waiting steps of 1, 2, 3, ... seconds
    pub fn steps(&self) -> impl Iterator<Item = Duration> {
        (1..=self.max_steps).map(Duration::from_secs)
    }

    /// Longest time discovery waits before falling back
    pub fn max_wait(&self) -> Duration {
        self.steps().sum()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, ttl) in [
            ("alive_ttl", self.alive_ttl),
            ("sync_ttl", self.sync_ttl),
            ("hello_ttl", self.hello_ttl),
            ("dead_ttl", self.dead_ttl),
        ] {
            if ttl == 0 {
                errors.push(format!("discovery.{name} must be greater than 0"));
            }
        }

        if self.max_steps == 0 {
            errors.push("discovery.max_steps must be greater than 0".to_string());
        } else if self.max_steps > 60 {
            errors.push(format!(
                "discovery.max_steps too large: {} (maximum: 60)",
                self.max_steps
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("relaynet"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(PathBuf),
        Many(Vec<PathBuf>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
