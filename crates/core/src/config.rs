//! FarmRelay Configuration
//!
//! Configuration structures with serde defaults, a loader that searches the
//! usual locations, environment overrides and validation.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Constants
// ============================================================================

/// Default bind host
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 8000;
/// Default HTTP read API port
pub const DEFAULT_API_PORT: u16 = 8001;
/// Default per-session outbound queue capacity
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;
/// Default heartbeat ping interval (seconds)
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 30;
/// Default idle timeout (seconds)
pub const DEFAULT_IDLE_TIMEOUT: u64 = 60;
/// Default SQLite database path
pub const DEFAULT_DATABASE_PATH: &str = "farmtech_data.db";
/// Default data retention (days)
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
/// Default number of recent readings in a dashboard snapshot
pub const DEFAULT_SNAPSHOT_LIMIT: usize = 100;
/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

const CONFIG_FILE_NAME: &str = "farmrelay.yaml";

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

// ============================================================================
// Main Config
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener and connection settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============================================================================
// Server Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host for both listeners
    #[serde(default = "ServerConfig::default_host")]
    pub host: String,
    /// WebSocket port (devices and dashboards)
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    /// HTTP read API port
    #[serde(default = "ServerConfig::default_api_port")]
    pub api_port: u16,
    /// Capacity of each session's outbound queue
    #[serde(default = "ServerConfig::default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Server ping interval in seconds, 0 disables
    #[serde(default = "ServerConfig::default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Close connections silent for this long, 0 disables
    #[serde(default = "ServerConfig::default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// CORS origins for the read API
    #[serde(default = "ServerConfig::default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    fn default_host() -> String {
        DEFAULT_HOST.to_string()
    }
    fn default_port() -> u16 {
        DEFAULT_PORT
    }
    fn default_api_port() -> u16 {
        DEFAULT_API_PORT
    }
    fn default_outbound_buffer() -> usize {
        DEFAULT_OUTBOUND_BUFFER
    }
    fn default_heartbeat_interval() -> u64 {
        DEFAULT_HEARTBEAT_INTERVAL
    }
    fn default_idle_timeout() -> u64 {
        DEFAULT_IDLE_TIMEOUT
    }
    fn default_allowed_origins() -> Vec<String> {
        vec!["*".to_string()]
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.host, self.api_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: DEFAULT_PORT,
            api_port: DEFAULT_API_PORT,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT,
            allowed_origins: Self::default_allowed_origins(),
        }
    }
}

// ============================================================================
// Storage Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "StorageConfig::default_database_path")]
    pub database_path: PathBuf,
    /// Readings older than this many days are pruned, 0 keeps everything
    #[serde(default = "StorageConfig::default_retention_days")]
    pub retention_days: u32,
    /// Recent readings included in a dashboard snapshot
    #[serde(default = "StorageConfig::default_snapshot_limit")]
    pub snapshot_limit: usize,
}

impl StorageConfig {
    fn default_database_path() -> PathBuf {
        PathBuf::from(DEFAULT_DATABASE_PATH)
    }
    fn default_retention_days() -> u32 {
        DEFAULT_RETENTION_DAYS
    }
    fn default_snapshot_limit() -> usize {
        DEFAULT_SNAPSHOT_LIMIT
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: Self::default_database_path(),
            retention_days: DEFAULT_RETENTION_DAYS,
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
        }
    }
}

// ============================================================================
// Logging Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level for the relay's own crates (trace, debug, info, warn, error)
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        DEFAULT_LOG_LEVEL.to_string()
    }

    /// EnvFilter directive covering the relay crates.
    pub fn filter_directive(&self) -> String {
        let level = self.level.to_lowercase();
        format!(
            "farmrelay={level},farmrelay_core={level},farmrelay_gateway={level},farmrelay_storage={level},warn"
        )
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

// ============================================================================
// Config Loading and Validation
// ============================================================================

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from an explicit path, the default locations, or
    /// fall back to built-in defaults when no file exists.
    pub fn load(path: Option<&str>) -> Result<Config, RelayError> {
        let config = match Self::resolve_config_path(path)? {
            Some(config_path) => {
                tracing::info!("Loading config from {}", config_path.display());
                Self::load_file(&config_path)?
            }
            None => {
                tracing::info!("No config file found, using defaults");
                Config::default()
            }
        };
        Ok(config)
    }

    /// Parse a single YAML file
    pub fn load_file(path: &Path) -> Result<Config, RelayError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::config_parse_error(format!("Failed to read: {}", e)))?;
        let config: Config = serde_yml::from_str(&content)
            .map_err(|e| RelayError::config_parse_error(format!("Failed to parse: {}", e)))?;
        Ok(config)
    }

    fn resolve_config_path(path: Option<&str>) -> Result<Option<PathBuf>, RelayError> {
        if let Some(p) = path {
            let explicit = PathBuf::from(p);
            if !explicit.exists() {
                return Err(RelayError::config_not_found(p));
            }
            return Ok(Some(explicit));
        }

        let default_paths = [
            PathBuf::from(".").join(CONFIG_FILE_NAME),
            home_dir().join(".farmrelay/config.yaml"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(CONFIG_FILE_NAME),
        ];

        Ok(default_paths.into_iter().find(|p| p.exists()))
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<(), RelayError> {
        if config.server.port == 0 {
            return Err(RelayError::config_invalid("server.port", "must not be 0"));
        }
        if config.server.port == config.server.api_port {
            return Err(RelayError::config_invalid(
                "server.api_port",
                format!("must differ from server.port ({})", config.server.port),
            ));
        }
        if config.server.outbound_buffer == 0 {
            return Err(RelayError::config_invalid(
                "server.outbound_buffer",
                "must be greater than 0",
            ));
        }
        if config.storage.snapshot_limit == 0 {
            return Err(RelayError::config_invalid(
                "storage.snapshot_limit",
                "must be greater than 0",
            ));
        }
        if config.storage.database_path.as_os_str().is_empty() {
            return Err(RelayError::config_invalid(
                "storage.database_path",
                "cannot be empty",
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, RelayError> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::config_invalid(name, format!("cannot parse '{}'", value)))
}

impl Config {
    /// Load configuration (file or defaults) and apply environment overrides
    pub fn load(path: Option<&str>) -> Result<Self, RelayError> {
        let mut config = ConfigLoader::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `HOST`, `PORT`, `API_PORT`, `DATABASE_PATH`, `DATA_RETENTION_DAYS`,
    /// `LOG_LEVEL` and `ALLOWED_ORIGINS` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), RelayError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(port) = lookup("API_PORT") {
            self.server.api_port = parse_env("API_PORT", &port)?;
        }
        if let Some(path) = lookup("DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Some(days) = lookup("DATA_RETENTION_DAYS") {
            self.storage.retention_days = parse_env("DATA_RETENTION_DAYS", &days)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), RelayError> {
        let content = serde_yml::to_string(self)
            .map_err(|e| RelayError::config_parse_error(format!("Serialization failed: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                ..ServerConfig::default()
            },
            storage: StorageConfig {
                database_path: home_dir().join(".farmrelay/farmtech_data.db"),
                ..StorageConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }
}
