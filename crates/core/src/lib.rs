pub mod config;
pub mod error;
pub mod reading;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, ConfigValidator, LoggingConfig, ServerConfig, StorageConfig};
pub use error::{DomainError, InfraError, RelayError};
pub use reading::{format_timestamp, now_timestamp, SensorPayload, SensorReading};
