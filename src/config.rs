//! # Configuration Management
//!
//! Centralized configuration for peerwire connections and listeners.
//!
//! Every knob a [`Connection`](crate::connection::Connection) or
//! [`Listener`](crate::transport::listener::Listener) reads lives here: socket
//! options, which transit strategy drives the socket, UDP behaviour, clock
//! sampling, pool sizing and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides (`PEERWIRE_*`) via `from_env()`

use crate::error::{ProtocolError, Result};
use crate::utils::compression::CompressionKind;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed body size after compression/encryption (16 MB)
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Largest UDP datagram the transits will emit, header included
pub const MAX_UDP_DATAGRAM: usize = 1024;

/// Number of recently processed TCP packet ids remembered for duplicate suppression
pub const DEDUP_WINDOW: usize = 25;

/// Interval between flush rechecks while a kill waits for queued bytes
pub const KILL_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on flush rechecks before a kill tears down regardless
pub const KILL_FLUSH_MAX_CHECKS: u32 = 20;

/// How often idle transits wake to drive clock sampling and keep-alives
pub const IDLE_TICK: Duration = Duration::from_millis(100);

/// Which I/O strategy drives a connection's socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitKind {
    /// Tokio tasks; reads re-armed on completion, writes chained from completion
    #[default]
    Completion,
    /// Host calls `pump()` from its own loop
    Polling,
    /// One receive thread and one send thread per connection
    Threaded,
}

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Per-connection behaviour
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Clock synchronization schedule
    #[serde(default)]
    pub clock: ClockConfig,

    /// Socket resource pool sizing
    #[serde(default)]
    pub pool: PoolConfig,

    /// Listening side configuration
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PEERWIRE_LISTEN_ADDRESS") {
            config.listener.address = addr;
        }

        if let Ok(port) = std::env::var("PEERWIRE_UDP_PORT") {
            if let Ok(val) = port.parse::<u16>() {
                config.listener.udp_port = val;
            }
        }

        if let Ok(transit) = std::env::var("PEERWIRE_TRANSIT") {
            config.connection.transit = match transit.to_ascii_lowercase().as_str() {
                "completion" => TransitKind::Completion,
                "polling" => TransitKind::Polling,
                "threaded" => TransitKind::Threaded,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Unknown transit kind in PEERWIRE_TRANSIT: {other}"
                    )))
                }
            };
        }

        if let Ok(udp) = std::env::var("PEERWIRE_UDP_ENABLED") {
            if let Ok(val) = udp.parse::<bool>() {
                config.connection.udp_enabled = val;
            }
        }

        if let Ok(samples) = std::env::var("PEERWIRE_CLOCK_SAMPLES") {
            if let Ok(val) = samples.parse::<i32>() {
                config.clock.sample_count = val;
            }
        }

        if let Ok(interval) = std::env::var("PEERWIRE_CLOCK_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                config.clock.sync_interval = Duration::from_millis(val);
            }
        }

        if let Ok(level) = std::env::var("PEERWIRE_LOG_LEVEL") {
            if let Ok(val) = level.parse::<Level>() {
                config.logging.log_level = val;
            }
        }

        Ok(config)
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

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.connection.validate());
        errors.extend(self.clock.validate());
        errors.extend(self.pool.validate());
        errors.extend(self.listener.validate());
        errors.extend(self.logging.validate());
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
}

/// Per-connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Disable Nagle on the TCP socket
    pub no_delay: bool,

    /// Dispatch inbound packets on the I/O path; when false they queue until
    /// `Connection::pump_inbound` is called
    pub process_immediately: bool,

    /// Allow UDP enablement after login
    pub udp_enabled: bool,

    /// Send NAT pokes over UDP to keep the mapping open
    pub udp_keepalive: bool,

    /// Interval between NAT pokes
    #[serde(with = "duration_serde")]
    pub udp_keepalive_interval: Duration,

    /// Prefer IPv6 results when resolving the peer host
    pub use_ipv6: bool,

    /// Suppress re-dispatch of recently processed TCP packet ids. Off unless
    /// explicitly enabled.
    pub suppress_duplicates: bool,

    /// Socket I/O strategy
    pub transit: TransitKind,

    /// Compression applied to bodies flagged COMPRESSED
    pub compression: CompressionKind,

    /// Largest accepted body length in bytes
    pub max_body_size: usize,

    /// RSA modulus size for generated handshake identities
    pub rsa_bits: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            process_immediately: true,
            udp_enabled: false,
            udp_keepalive: false,
            udp_keepalive_interval: Duration::from_secs(5),
            use_ipv6: false,
            suppress_duplicates: false,
            transit: TransitKind::Completion,
            compression: CompressionKind::Lz4,
            max_body_size: MAX_BODY_SIZE,
            rsa_bits: 2048,
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_body_size == 0 {
            errors.push("Max body size cannot be 0".to_string());
        } else if self.max_body_size > MAX_BODY_SIZE {
            errors.push(format!(
                "Max body size too large: {} bytes (maximum: {MAX_BODY_SIZE})",
                self.max_body_size
            ));
        }

        if self.udp_keepalive {
            if !self.udp_enabled {
                errors.push("udp_keepalive requires udp_enabled".to_string());
            }
            if self.udp_keepalive_interval.as_millis() < 100 {
                errors.push("UDP keep-alive interval too short (minimum: 100ms)".to_string());
            }
        }

        if self.rsa_bits < 1024 {
            errors.push(format!(
                "RSA modulus too small: {} bits (minimum: 1024)",
                self.rsa_bits
            ));
        } else if self.rsa_bits > 8192 {
            errors.push(format!(
                "RSA modulus too large: {} bits (maximum: 8192)",
                self.rsa_bits
            ));
        }

        errors
    }
}

/// Clock synchronization schedule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClockConfig {
    /// Samples per cycle; zero or negative disables sampling on this side
    pub sample_count: i32,

    /// Window the samples of one cycle are spread over
    #[serde(with = "duration_serde")]
    pub sample_window: Duration,

    /// Idle time between cycles
    #[serde(with = "duration_serde")]
    pub sync_interval: Duration,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sample_count: 5,
            sample_window: Duration::from_secs(2),
            sync_interval: Duration::from_secs(60),
        }
    }
}

impl ClockConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.sample_count > 100 {
            errors.push(format!(
                "Clock sample count too high: {} (maximum: 100)",
                self.sample_count
            ));
        }

        if self.sample_count > 0 && self.sync_interval.as_millis() < 100 {
            errors.push("Clock sync interval too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Socket resource pool sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Bytes per slot
    pub buffer_size: usize,

    pub read_slots: usize,

    pub write_slots: usize,

    pub accept_slots: usize,

    /// Extra slots per class allocated up front
    pub headroom: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            read_slots: 64,
            write_slots: 64,
            accept_slots: 8,
            headroom: 4,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.buffer_size < 64 {
            errors.push("Pool buffer size too small (minimum: 64 bytes)".to_string());
        } else if self.buffer_size > 1024 * 1024 {
            errors.push(format!(
                "Pool buffer size too large: {} bytes (maximum: 1 MB)",
                self.buffer_size
            ));
        }

        if self.read_slots == 0 || self.write_slots == 0 {
            errors.push("Read and write slot counts must be greater than 0".to_string());
        }

        errors
    }
}

/// Listening side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// TCP listen address (e.g., "127.0.0.1:7700")
    pub address: String,

    /// UDP port advertised in NatInfo; 0 disables the UDP listener
    pub udp_port: u16,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Timeout for graceful listener shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7700"),
            udp_port: 0,
            max_connections: 1000,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ListenerConfig {
    /// Validate listener configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Listener address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid listener address format: '{}' (expected format: '0.0.0.0:7700')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
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
            app_name: String::from("peerwire"),
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
                if let Some(parent) = std::path::Path::new(path).parent() {
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

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
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
