//! Configuration management for the file server
//!
//! Settings are read from a TOML file, then overridden from `TFS_*` environment
//! variables and finally from the command line (see `main.rs`).

use crate::core::error::{Error, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default config file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "tiered-fileserver.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,

    /// Worker pool sizing
    pub pool: PoolConfig,

    /// Adaptive scheduler tuning
    pub scheduler: SchedulerConfig,

    /// Per-connection network behaviour
    pub network: NetworkConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub bind_addr: IpAddr,

    /// Primary port (0 picks a free port)
    pub port: u16,

    /// Run the adaptive scheduler and its side-channel listener
    pub adaptive: bool,

    /// Side-channel port (0 picks a free port)
    pub adaptive_port: u16,

    /// Directory files are served from
    pub directory: PathBuf,

    /// Listen backlog for both listeners
    pub listen_backlog: u32,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on live (active or cached) workers
    pub max_workers: usize,

    /// How long a cached worker waits for reuse before exiting
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub idle_timeout: Duration,

    /// Stack size for worker threads in bytes (platform default if unset)
    pub worker_stack_size: Option<usize>,
}

/// Which end of the speed ordering forms the high-priority tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedOrder {
    /// Lowest reported speed ranks first
    #[default]
    Ascending,
    /// Highest reported speed ranks first
    Descending,
}

/// Adaptive scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Share of registered clients in the high tier (percent, rounded up)
    pub high_percent: u32,

    /// Share of registered clients in the medium tier (percent, rounded up)
    pub medium_percent: u32,

    /// Sort direction of the registry
    pub speed_order: SpeedOrder,

    /// Registry storage grows in steps of this many entries
    pub registry_growth: usize,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Time a side channel has to send its client id
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub handshake_timeout: Duration,

    /// Read timeout on primary connections; sessions check for shutdown on each tick
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub read_poll_interval: Duration,

    /// Longest accepted request or side-channel line (bytes)
    pub max_line_length: usize,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    #[default]
    Pretty,
    /// Single-line output
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format
    pub format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            adaptive: false,
            adaptive_port: 0,
            directory: PathBuf::from("imgs/"),
            listen_backlog: 10,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 100,
            idle_timeout: Duration::from_secs(60),
            worker_stack_size: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            high_percent: 20,
            medium_percent: 30,
            speed_order: SpeedOrder::Ascending,
            registry_growth: 10,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            read_poll_interval: Duration::from_millis(500),
            max_line_length: 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from the default file (if present) and environment variables
    pub fn load() -> Result<Self> {
        let mut config = if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup; split out so tests need not touch the process env
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("TFS_BIND_ADDR") {
            self.server.bind_addr = addr.parse()
                .map_err(|e| Error::config(format!("Invalid bind address: {}", e)))?;
        }

        if let Some(port) = lookup("TFS_PORT") {
            self.server.port = port.parse()
                .map_err(|e| Error::config(format!("Invalid port: {}", e)))?;
        }

        if let Some(adaptive) = lookup("TFS_ADAPTIVE") {
            self.server.adaptive = parse_bool(&adaptive)
                .ok_or_else(|| Error::config(format!("Invalid adaptive flag: {}", adaptive)))?;
        }

        if let Some(dir) = lookup("TFS_DIRECTORY") {
            self.server.directory = PathBuf::from(dir);
        }

        if let Some(workers) = lookup("TFS_MAX_WORKERS") {
            self.pool.max_workers = workers.parse()
                .map_err(|e| Error::config(format!("Invalid max workers: {}", e)))?;
        }

        if let Some(timeout) = lookup("TFS_IDLE_TIMEOUT") {
            self.pool.idle_timeout = parse_duration(&timeout)
                .map_err(|e| Error::config(format!("Invalid idle timeout: {}", e)))?;
        }

        if let Some(level) = lookup("TFS_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_workers == 0 {
            return Err(Error::config("Pool needs at least one worker"));
        }

        if self.pool.idle_timeout.is_zero() {
            return Err(Error::config("Idle timeout must be non-zero"));
        }

        if self.scheduler.high_percent + self.scheduler.medium_percent > 100 {
            return Err(Error::config("High and medium tier shares exceed 100%"));
        }

        if self.scheduler.registry_growth == 0 {
            return Err(Error::config("Registry growth step must be non-zero"));
        }

        if self.network.max_line_length < 16 {
            return Err(Error::config("Max line length too small (minimum 16 bytes)"));
        }

        if self.network.read_poll_interval.is_zero() || self.network.handshake_timeout.is_zero() {
            return Err(Error::config("Network timeouts must be non-zero"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {},
            _ => return Err(Error::config("Invalid log level")),
        }

        Ok(())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// Custom deserializer for Duration from string
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string like '30s' or '500ms', or a number of seconds")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            parse_duration(value).map_err(E::custom)
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative duration"))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if duration.subsec_millis() == 0 {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    } else {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }
}

/// Simple duration parser for common formats
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let ms: u64 = ms.parse().map_err(|_| "Invalid milliseconds")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(secs) = s.strip_suffix('s') {
        let secs: u64 = secs.parse().map_err(|_| "Invalid seconds")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins: u64 = mins.parse().map_err(|_| "Invalid minutes")?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours: u64 = hours.parse().map_err(|_| "Invalid hours")?;
        Ok(Duration::from_secs(hours * 3600))
    } else {
        // Try parsing as raw seconds
        let secs: u64 = s.parse().map_err(|_| "Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    }
}
